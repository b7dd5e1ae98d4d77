//! Symbolic key tokens (spec §4.7 Open Question, resolved in SPEC_FULL.md §4.7) translated
//! to the byte sequence a PTY slave expects. Used by `POST /input {key}` and the control
//! socket's `{"type":"input","key":...}` frame.

use crate::error::{Error, Result};

/// Translate a symbolic key name to the raw bytes to write to the PTY. Unknown names are
/// `Error::InvalidArgument` — this is the closed set the spec requires be published.
pub fn key_to_bytes(key: &str) -> Result<Vec<u8>> {
    let bytes: &[u8] = match key {
        "enter" => b"\r",
        "escape" => b"\x1b",
        "tab" => b"\t",
        "backspace" => b"\x7f",
        "up" => b"\x1b[A",
        "down" => b"\x1b[B",
        "right" => b"\x1b[C",
        "left" => b"\x1b[D",
        "home" => b"\x1b[H",
        "end" => b"\x1b[F",
        "page_up" => b"\x1b[5~",
        "page_down" => b"\x1b[6~",
        "delete" => b"\x1b[3~",
        "f1" => b"\x1bOP",
        "f2" => b"\x1bOQ",
        "f3" => b"\x1bOR",
        "f4" => b"\x1bOS",
        "f5" => b"\x1b[15~",
        "f6" => b"\x1b[17~",
        "f7" => b"\x1b[18~",
        "f8" => b"\x1b[19~",
        "f9" => b"\x1b[20~",
        "f10" => b"\x1b[21~",
        "f11" => b"\x1b[23~",
        "f12" => b"\x1b[24~",
        other => return ctrl_letter(other),
    };
    Ok(bytes.to_vec())
}

fn ctrl_letter(key: &str) -> Result<Vec<u8>> {
    if let Some(letter) = key.strip_prefix("ctrl_") {
        let mut chars = letter.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if c.is_ascii_lowercase() {
                // Ctrl-<letter> maps to the control code (letter - 'a' + 1).
                let code = (c as u8) - b'a' + 1;
                return Ok(vec![code]);
            }
        }
    }
    Err(Error::InvalidArgument(format!("unknown key token: {key}")))
}

/// The full closed set of key tokens this server accepts, for publishing in API docs.
pub const KEY_TOKENS: &[&str] = &[
    "enter", "escape", "tab", "backspace", "up", "down", "left", "right", "home", "end",
    "page_up", "page_down", "delete", "f1", "f2", "f3", "f4", "f5", "f6", "f7", "f8", "f9",
    "f10", "f11", "f12", "ctrl_a", "ctrl_b", "ctrl_c", "ctrl_d", "ctrl_e", "ctrl_f", "ctrl_g",
    "ctrl_h", "ctrl_i", "ctrl_j", "ctrl_k", "ctrl_l", "ctrl_m", "ctrl_n", "ctrl_o", "ctrl_p",
    "ctrl_q", "ctrl_r", "ctrl_s", "ctrl_t", "ctrl_u", "ctrl_v", "ctrl_w", "ctrl_x", "ctrl_y",
    "ctrl_z",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctrl_d_is_eot() {
        assert_eq!(key_to_bytes("ctrl_d").unwrap(), vec![0x04]);
    }

    #[test]
    fn enter_is_cr() {
        assert_eq!(key_to_bytes("enter").unwrap(), b"\r".to_vec());
    }

    #[test]
    fn unknown_key_is_invalid_argument() {
        assert!(matches!(
            key_to_bytes("meta_q"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn published_set_all_parse() {
        for token in KEY_TOKENS {
            assert!(key_to_bytes(token).is_ok(), "{token} should be a valid key token");
        }
    }
}
