/// Escapes non-printable bytes so raw protocol input is safe to log.
pub fn bytes_to_human_str(input: &[u8]) -> String {
    input.escape_ascii().to_string()
}
