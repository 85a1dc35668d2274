use std::fmt;

/// A system requirement the launcher cannot run without, with a hint for fixing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  - {}: {} ({})", self.name, self.purpose, self.hint)
    }
}

pub(crate) const DESKTOP_COMPOSITION: MissingPrereq = MissingPrereq {
    name: "desktop composition",
    purpose: "Store applications only activate while the compositor is running",
    hint: "run from an interactive desktop session, not a service or locked session",
};

/// Format a list of missing prerequisites into a user-facing error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nstorelaunch needs these to deploy and activate Store applications.");
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_prereq_display() {
        let s = DESKTOP_COMPOSITION.to_string();
        assert!(s.starts_with("  - desktop composition:"));
        assert!(s.contains("interactive desktop session"));
    }

    #[test]
    fn format_missing_lists_every_item() {
        let other = MissingPrereq {
            name: "developer mode",
            purpose: "registering unpacked packages",
            hint: "enable it under Settings",
        };
        let output = format_missing(&[DESKTOP_COMPOSITION, other]);
        assert!(output.starts_with("missing prerequisites:\n"));
        assert!(output.contains("desktop composition"));
        assert!(output.contains("developer mode"));
    }
}
