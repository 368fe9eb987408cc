/// Compares program output with expected output
///
/// Only leading and trailing whitespace of the whole output is ignored.
/// Internal whitespace, letter case and line endings are significant.
pub fn outputs_match(program_output: &str, expected_output: &str) -> bool {
    program_output.trim() == expected_output.trim()
}
