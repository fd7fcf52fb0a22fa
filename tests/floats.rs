use std::{error::Error, path::Path};

use test_utils::{check_compilation, Expected};

const SRC_PATH: &str = "./demos/floats.coatl";
const EXPECTED: Expected = Expected {
    stdout: "",
    exit: 42,
};

#[test]
fn compile_and_run_floats() -> Result<(), Box<dyn Error>> {
    check_compilation(Path::new(SRC_PATH), EXPECTED)
}
