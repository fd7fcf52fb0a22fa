use std::{
    error::Error,
    io,
    path::Path,
    process::{Command, Output},
    str,
};

const COATLC_PATH: &str = "./target/debug/coatlc";
const OUTPUT_PATH: &str = "./output";

pub struct Expected<'a> {
    pub stdout: &'a str,
    pub exit: i32,
}

impl<'a> Expected<'a> {
    fn assert_matches(self, output: &Output) -> Result<(), Box<dyn Error>> {
        assert_eq!(str::from_utf8(&output.stdout)?, self.stdout);
        assert_eq!(
            output.status.code(),
            Some(self.exit),
            "compiled program exited with status {:?}",
            output.status.code()
        );
        Ok(())
    }
}

/// End-to-end tests need an x86-64 Linux host with GNU `as` on the PATH;
/// anywhere else they are skipped.
pub fn host_can_run_executables() -> bool {
    if !cfg!(all(target_os = "linux", target_arch = "x86_64")) {
        return false;
    }
    Command::new("as")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn run_compiler(src_path: &Path, out_path: &Path) -> Result<Output, io::Error> {
    Command::new(COATLC_PATH)
        .arg("build")
        .arg(src_path)
        .arg("-o")
        .arg(out_path)
        .output()
}

fn run_frontend(src_path: &Path, out_path: &Path) -> Result<Output, io::Error> {
    Command::new(COATLC_PATH)
        .arg("ir")
        .arg(src_path)
        .arg("-o")
        .arg(out_path)
        .output()
}

/// Compile `src_path` to an executable and compare the run against
/// `expected`.
pub fn check_compilation(src_path: &Path, expected: Expected) -> Result<(), Box<dyn Error>> {
    if !host_can_run_executables() {
        eprintln!("skipping end-to-end check: host cannot assemble/run x86-64 Linux binaries");
        return Ok(());
    }

    std::fs::create_dir_all(OUTPUT_PATH)?;
    let out_path = Path::new(OUTPUT_PATH).join(src_path.file_stem().unwrap());

    let compile_output = run_compiler(src_path, &out_path)?;
    let compile_stderr = std::str::from_utf8(&compile_output.stderr)?;

    assert!(compile_stderr.is_empty(), "{}", compile_stderr);
    assert!(
        compile_output.status.success(),
        "coatlc exited with status {:?}",
        compile_output.status.code()
    );

    let output = Command::new(&out_path).output()?;
    expected.assert_matches(&output)?;

    Ok(())
}

/// Run only the frontend and expect it to fail with a diagnostic record
/// starting with `code`.
pub fn check_failing_parse(src_path: &Path, code: u32) -> Result<(), Box<dyn Error>> {
    std::fs::create_dir_all(OUTPUT_PATH)?;
    let out_path = Path::new(OUTPUT_PATH)
        .join(src_path.file_stem().unwrap())
        .with_extension("ir");

    let output = run_frontend(src_path, &out_path)?;
    assert!(
        !output.status.success(),
        "frontend should reject '{}'",
        src_path.display()
    );

    let stderr = std::str::from_utf8(&output.stderr)?;
    let record_code = stderr
        .lines()
        .find_map(|line| line.split_whitespace().next()?.parse::<u32>().ok());
    assert_eq!(
        record_code,
        Some(code),
        "unexpected diagnostic record in: {stderr}"
    );

    Ok(())
}
