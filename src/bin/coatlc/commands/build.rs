use std::{fs, path::PathBuf, process::Command};

use coatl::{error::CompileError, ir_to_asm, linker, source_to_ir};
use log::info;

use crate::cli::StageArgs;

use super::expect_extension;

/// Run the whole pipeline: frontend, backend, external assembler, linker.
/// Intermediate files are placed next to the output.
pub fn build_executable(args: &StageArgs) -> Result<(), CompileError> {
    expect_extension(&args.file, &["coatl", "mee"])?;

    let stem = args.output.to_string_lossy();
    let ir_path = PathBuf::from(format!("{stem}.ir"));
    let asm_path = PathBuf::from(format!("{stem}.s"));
    let obj_path = PathBuf::from(format!("{stem}.o"));

    let source = fs::read_to_string(&args.file)?;

    info!("compiling '{}'...", args.file.display());
    let ir_text = source_to_ir(&source)?;
    fs::write(&ir_path, &ir_text)?;

    let asm = ir_to_asm(&ir_text)?;
    fs::write(&asm_path, asm)?;

    assemble(&asm_path, &obj_path)?;

    info!("linking '{}'...", args.output.display());
    linker::link_file(&obj_path, &args.output, linker::DEFAULT_ENTRY)?;

    Ok(())
}

fn assemble(asm_path: &PathBuf, obj_path: &PathBuf) -> Result<(), CompileError> {
    info!("assembling '{}'...", asm_path.display());

    let output = Command::new("as")
        .arg("-o")
        .arg(obj_path)
        .arg(asm_path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CompileError::Assembler(stderr.trim().to_owned()));
    }

    Ok(())
}
