use std::{error::Error, path::Path};

use test_utils::{check_compilation, Expected};

const SRC_PATH: &str = "./demos/return7.coatl";
const EXPECTED: Expected = Expected {
    stdout: "",
    exit: 7,
};

#[test]
fn compile_and_run_return7() -> Result<(), Box<dyn Error>> {
    check_compilation(Path::new(SRC_PATH), EXPECTED)
}
