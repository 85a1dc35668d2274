use crate::CoreError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use storelaunch_runtime::PlatformBackend;
use storelaunch_schema::PackageFamilyName;
use tracing::{debug, info, warn};

/// Returned in place of the captured output when it cannot be read.
pub const STDOUT_PLACEHOLDER: &str = "(null)";

/// Files a test app leaves in its private storage: the captured console
/// output and an optional exit-code override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxArtifacts {
    stdout: PathBuf,
    exit_code: PathBuf,
}

impl SandboxArtifacts {
    pub fn new(container: &Path) -> Self {
        Self {
            stdout: container.join("LocalState").join("AC").join("stdout.txt"),
            exit_code: container.join("AC").join("Temp").join("exitcode.txt"),
        }
    }

    /// Resolve the artifact paths for an installed package family.
    pub fn locate(
        backend: &dyn PlatformBackend,
        family: &PackageFamilyName,
    ) -> Result<Self, CoreError> {
        let container = backend.container_folder(family)?;
        debug!("container folder for {family}: {}", container.display());
        Ok(Self::new(&container))
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout
    }

    pub fn exit_code_path(&self) -> &Path {
        &self.exit_code
    }

    /// Delete artifacts left by an earlier run. Missing files are fine; any
    /// other failure to delete is an error.
    pub fn clear(&self) -> Result<(), CoreError> {
        for path in [&self.stdout, &self.exit_code] {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("deleted stale {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Captured output, or [`STDOUT_PLACEHOLDER`] when it cannot be read.
    pub fn read_stdout(&self) -> String {
        match std::fs::read(&self.stdout) {
            Ok(bytes) => decode_output(&bytes),
            Err(e) => {
                warn!("cannot read {}: {e}", self.stdout.display());
                STDOUT_PLACEHOLDER.to_owned()
            }
        }
    }

    /// Exit code written by the app itself, if it wrote one.
    pub fn read_exit_code(&self) -> Option<u32> {
        let text = std::fs::read(&self.exit_code).ok()?;
        let code = parse_exit_code(&String::from_utf8_lossy(&text));
        info!("process exited with return code (from exitcode.txt) {}", code as i32);
        Some(code)
    }
}

fn decode_output(bytes: &[u8]) -> String {
    match bytes {
        [0xFF, 0xFE, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Parse the first line of an exit-code file the way C's `strtol(s, NULL, 0)`
/// does: leading whitespace, optional sign, `0x` for hex, a leading `0` for
/// octal, and trailing garbage ignored. Anything unparsable is `0`. The value
/// saturates to the 32-bit signed range and is then reinterpreted as unsigned,
/// so `-1` becomes `0xFFFFFFFF`.
pub fn parse_exit_code(text: &str) -> u32 {
    let line = text.lines().next().unwrap_or_default();
    let s = line.trim_start();
    let (negative, s) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let (radix, digits) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        if hex.starts_with(|c: char| c.is_ascii_hexdigit()) {
            (16, hex)
        } else {
            // "0x" with no hex digit parses as the single digit 0.
            (8, "0")
        }
    } else if s.starts_with('0') {
        (8, s)
    } else {
        (10, s)
    };

    let mut value: i64 = 0;
    for c in digits.chars() {
        let Some(digit) = c.to_digit(radix) else {
            break;
        };
        value = value.saturating_mul(i64::from(radix)).saturating_add(i64::from(digit));
    }
    if negative {
        value = -value;
    }
    let clamped = value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
    clamped as u32
}
