use std::iter::Peekable;
use std::str::CharIndices;

use crate::error::VlmError;

/// Decode backslash escape sequences in a raw prompt.
///
/// Follows the rules of Python's `unicode_escape` codec so that a prompt typed on the
/// command line as `Hi\nthere` reaches the model with a real newline:
///
/// - single character escapes: `\\ \' \" \a \b \f \n \r \t \v`
/// - octal escapes with one to three digits: `\101`
/// - hexadecimal escapes: `\xhh`, `\uhhhh`, `\Uhhhhhhhh`
/// - a backslash followed by a newline is removed
/// - unknown escapes such as `\q` are kept verbatim
///
/// Characters outside ASCII are passed through unchanged.
///
/// # Errors
///
/// Returns [`VlmError::InvalidEscape`] on a trailing backslash, a truncated hexadecimal
/// escape, a code point that is not a valid `char`, or a named `\N{...}` escape.
pub fn decode_unicode_escape(raw: &str) -> Result<String, VlmError> {
    let mut decoded = String::with_capacity(raw.len());
    let mut chars = raw.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        if c != '\\' {
            decoded.push(c);
            continue;
        }

        let Some((_, escape)) = chars.next() else {
            return Err(invalid(pos, "\\ at end of string"));
        };

        match escape {
            '\n' => {}
            '\\' => decoded.push('\\'),
            '\'' => decoded.push('\''),
            '"' => decoded.push('"'),
            'a' => decoded.push('\x07'),
            'b' => decoded.push('\x08'),
            'f' => decoded.push('\x0c'),
            'n' => decoded.push('\n'),
            'r' => decoded.push('\r'),
            't' => decoded.push('\t'),
            'v' => decoded.push('\x0b'),
            '0'..='7' => {
                let mut value = escape as u32 - '0' as u32;
                for _ in 0..2 {
                    match chars.peek() {
                        Some(&(_, d @ '0'..='7')) => {
                            value = value * 8 + (d as u32 - '0' as u32);
                            chars.next();
                        }
                        _ => break,
                    }
                }
                // at most 0o777, always a valid scalar value
                decoded.push(char::from_u32(value).ok_or_else(|| {
                    invalid(pos, "illegal Unicode character")
                })?);
            }
            'x' => decoded.push(read_hex(&mut chars, pos, 2, "truncated \\xXX escape")?),
            'u' => decoded.push(read_hex(&mut chars, pos, 4, "truncated \\uXXXX escape")?),
            'U' => decoded.push(read_hex(
                &mut chars,
                pos,
                8,
                "truncated \\UXXXXXXXX escape",
            )?),
            'N' => return Err(invalid(pos, "named Unicode escapes are not supported")),
            other => {
                log::debug!("keeping unknown escape sequence \\{other} at byte {pos}");
                decoded.push('\\');
                decoded.push(other);
            }
        }
    }

    Ok(decoded)
}

fn read_hex(
    chars: &mut Peekable<CharIndices<'_>>,
    pos: usize,
    digits: usize,
    truncated: &str,
) -> Result<char, VlmError> {
    let mut value = 0u32;
    for _ in 0..digits {
        let digit = chars
            .next_if(|(_, c)| c.is_ascii_hexdigit())
            .and_then(|(_, c)| c.to_digit(16))
            .ok_or_else(|| invalid(pos, truncated))?;
        value = value
            .checked_mul(16)
            .and_then(|v| v.checked_add(digit))
            .ok_or_else(|| invalid(pos, "illegal Unicode character"))?;
    }
    char::from_u32(value).ok_or_else(|| invalid(pos, "illegal Unicode character"))
}

fn invalid(position: usize, reason: &str) -> VlmError {
    VlmError::InvalidEscape {
        position,
        reason: reason.to_string(),
    }
}
