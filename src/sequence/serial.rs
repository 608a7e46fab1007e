use crate::error::FabricError;

/// Produces the next value of a `serial` sequence.
pub trait SerialGenerator: Send + Sync {
    /// Value `steps` positions after `previous`.
    fn next(&self, previous: &str, steps: u64) -> Result<String, FabricError>;
}

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Lowercase base-36 counter, zero-padded to at least `width` characters.
#[derive(Debug, Clone, Copy)]
pub struct Base36Serial {
    pub width: usize,
}

impl Default for Base36Serial {
    fn default() -> Self {
        Self { width: 8 }
    }
}

impl Base36Serial {
    fn parse(text: &str) -> Result<u128, FabricError> {
        let mut acc: u128 = 0;
        for ch in text.chars() {
            let digit = ch
                .to_digit(36)
                .ok_or_else(|| FabricError::internal(format!("invalid serial value {text:?}")))?;
            acc = acc
                .checked_mul(36)
                .and_then(|a| a.checked_add(u128::from(digit)))
                .ok_or_else(|| FabricError::internal(format!("serial overflow at {text:?}")))?;
        }
        Ok(acc)
    }

    fn render(mut n: u128, width: usize) -> String {
        let mut out = Vec::new();
        loop {
            out.push(DIGITS[(n % 36) as usize]);
            n /= 36;
            if n == 0 {
                break;
            }
        }
        while out.len() < width {
            out.push(b'0');
        }
        out.reverse();
        String::from_utf8_lossy(&out).into_owned()
    }
}

impl SerialGenerator for Base36Serial {
    fn next(&self, previous: &str, steps: u64) -> Result<String, FabricError> {
        let n = Self::parse(previous)?
            .checked_add(u128::from(steps))
            .ok_or_else(|| FabricError::internal(format!("serial overflow at {previous:?}")))?;
        Ok(Self::render(n, self.width.max(previous.len())))
    }
}
