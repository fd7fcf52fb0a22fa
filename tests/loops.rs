use std::{error::Error, path::Path};

use test_utils::{check_compilation, Expected};

const SRC_PATH: &str = "./demos/while_sum.coatl";
const EXPECTED: Expected = Expected {
    stdout: "",
    exit: 10,
};

#[test]
fn compile_and_run_while_sum() -> Result<(), Box<dyn Error>> {
    check_compilation(Path::new(SRC_PATH), EXPECTED)
}
