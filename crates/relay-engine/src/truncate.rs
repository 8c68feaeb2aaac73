const DEFAULT_MAX_OUTPUT: usize = 64 * 1024;
const EXEC_MAX_OUTPUT: usize = 256 * 1024;

/// Returns the max output size for a given tool name.
pub fn max_output_for_tool(tool_name: &str) -> usize {
    match tool_name {
        "exec" => EXEC_MAX_OUTPUT,
        _ => DEFAULT_MAX_OUTPUT,
    }
}

/// Truncate tool output if it exceeds `max_bytes`.
/// Cuts at a char boundary and appends a marker showing original vs kept size.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let boundary = floor_char_boundary(output, max_bytes);
    format!(
        "{}\n\n[truncated: {} bytes -> {} bytes]",
        &output[..boundary],
        output.len(),
        boundary
    )
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_truncation_when_within_limit() {
        assert_eq!(truncate_output("hello world", 1024), "hello world");
        assert_eq!(truncate_output(&"a".repeat(100), 100), "a".repeat(100));
        assert_eq!(truncate_output("", 100), "");
    }

    #[test]
    fn truncates_at_limit() {
        let result = truncate_output(&"a".repeat(101), 100);
        assert!(result.starts_with(&"a".repeat(100)));
        assert!(result.ends_with("[truncated: 101 bytes -> 100 bytes]"));
    }

    #[test]
    fn truncates_at_char_boundary() {
        // 4-byte chars; a 10-byte cut keeps two of them.
        let input = "🦀".repeat(100);
        let result = truncate_output(&input, 10);
        assert!(result.starts_with("🦀🦀\n"));
        assert!(result.contains("[truncated: 400 bytes -> 8 bytes]"));
    }

    #[test]
    fn exec_gets_larger_limit() {
        assert_eq!(max_output_for_tool("exec"), 256 * 1024);
        assert_eq!(max_output_for_tool("files"), 64 * 1024);
    }
}
