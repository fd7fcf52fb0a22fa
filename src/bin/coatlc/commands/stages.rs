use std::{fs, path::Path};

use coatl::{error::CompileError, ir_to_asm, linker, source_to_ir};
use log::info;

use crate::cli::{LinkArgs, StageArgs};

/// File extensions enforce the pipeline phase of each stage.
pub fn expect_extension(path: &Path, allowed: &[&str]) -> Result<(), CompileError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if allowed.contains(&ext) {
        Ok(())
    } else {
        Err(CompileError::Usage(format!(
            "'{}' should have one of the extensions {:?}",
            path.display(),
            allowed
        )))
    }
}

pub fn run_frontend(args: &StageArgs) -> Result<(), CompileError> {
    expect_extension(&args.file, &["coatl", "mee"])?;
    expect_extension(&args.output, &["ir"])?;

    let source = fs::read_to_string(&args.file)?;
    let ir_text = source_to_ir(&source)?;
    fs::write(&args.output, ir_text)?;

    info!("wrote IR to '{}'", args.output.display());
    Ok(())
}

pub fn run_backend(args: &StageArgs) -> Result<(), CompileError> {
    expect_extension(&args.file, &["ir"])?;
    expect_extension(&args.output, &["s"])?;

    let ir_text = fs::read_to_string(&args.file)?;
    let asm = ir_to_asm(&ir_text)?;
    fs::write(&args.output, asm)?;

    info!("wrote assembly to '{}'", args.output.display());
    Ok(())
}

pub fn run_linker(args: &LinkArgs) -> Result<(), CompileError> {
    expect_extension(&args.file, &["o"])?;
    if args.output.extension().is_some() {
        return Err(CompileError::Usage(format!(
            "executable output '{}' should not carry an extension",
            args.output.display()
        )));
    }

    linker::link_file(&args.file, &args.output, &args.entry)?;

    info!("linked '{}'", args.output.display());
    Ok(())
}
