use console::style;

const RULE: &str =
    "==================================================================================";

/// Captured console output of a test app, framed for the run log.
pub fn app_output(content: &str) -> String {
    format!("\n\nSTDOUT & STDERR from immersive process:\n{RULE}\n\n{content}\n{RULE}")
}

pub fn success(exit_code: u32) -> String {
    // Printed signed, so the timeout sentinel reads as -1.
    format!(
        "\n{}\nExitCode {}",
        style("SUCCESS").green().bold(),
        exit_code as i32
    )
}

pub fn failure(code: Option<i32>, message: &str) -> String {
    let head = style("FAILED").red().bold();
    match code {
        Some(code) => format!("\n{head} 0x{:X} ({message})", code as u32),
        None => format!("\n{head} ({message})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use console::strip_ansi_codes;

    #[test]
    fn output_block_is_framed_by_rules() {
        let block = app_output("1 passed");
        assert!(block.starts_with("\n\nSTDOUT & STDERR from immersive process:\n"));
        assert!(block.contains("\n\n1 passed\n"));
        assert_eq!(block.matches(RULE).count(), 2);
        assert_eq!(RULE.len(), 82);
    }

    #[test]
    fn success_reports_signed_exit_code() {
        assert_eq!(strip_ansi_codes(&success(7)), "\nSUCCESS\nExitCode 7");
        assert_eq!(strip_ansi_codes(&success(u32::MAX)), "\nSUCCESS\nExitCode -1");
    }

    #[test]
    fn failure_shows_hresult_in_hex() {
        assert_eq!(
            strip_ansi_codes(&failure(Some(0x8007_3CF1_u32 as i32), "remove package failed")),
            "\nFAILED 0x80073CF1 (remove package failed)"
        );
        assert_eq!(strip_ansi_codes(&failure(None, "boom")), "\nFAILED (boom)");
    }
}
