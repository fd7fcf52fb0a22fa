use std::{error::Error, path::Path};

use test_utils::check_failing_parse;

#[test]
fn reject_struct_literal_with_missing_field() -> Result<(), Box<dyn Error>> {
    check_failing_parse(Path::new("./demos/missing_field.coatl"), 7230)
}

#[test]
fn reject_undefined_local() -> Result<(), Box<dyn Error>> {
    check_failing_parse(Path::new("./demos/undefined_local.coatl"), 4000)
}
