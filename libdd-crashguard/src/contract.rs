// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Library calls with checked argument contracts.
//!
//! A violated contract raises the invalid-argument condition through [`crate::check_arg!`]. If
//! the installed handlers return, the call fails with [`ArgumentError`] instead of proceeding.

use crate::check_arg;
use std::num::ParseIntError;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("invalid argument: {expression}")]
    Invalid { expression: &'static str },
    #[error("not a number: {0}")]
    Parse(#[from] ParseIntError),
}

/// Copies all of `src` into the front of `dst` and returns the number of bytes copied.
pub fn checked_copy(dst: Option<&mut [u8]>, src: Option<&[u8]>) -> Result<usize, ArgumentError> {
    check_arg!(dst.is_some(), "checked_copy")?;
    check_arg!(src.is_some(), "checked_copy")?;
    let (Some(dst), Some(src)) = (dst, src) else {
        return Err(ArgumentError::Invalid {
            expression: "dst.is_some() && src.is_some()",
        });
    };
    check_arg!(dst.len() >= src.len(), "checked_copy")?;
    dst[..src.len()].copy_from_slice(src);
    Ok(src.len())
}

/// Parses a TCP port. Zero is rejected.
pub fn checked_parse_port(input: Option<&str>) -> Result<u16, ArgumentError> {
    check_arg!(input.is_some(), "checked_parse_port")?;
    let port: u16 = input.unwrap_or_default().trim().parse()?;
    check_arg!(port != 0, "checked_parse_port")?;
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Contract violations run the process-wide invalid-argument chain, which terminates the
    // process when empty; these tests only exercise calls that satisfy the contract.

    #[test]
    fn test_checked_copy() {
        let mut dst = [0u8; 8];
        assert_eq!(checked_copy(Some(&mut dst), Some(b"crash")), Ok(5));
        assert_eq!(&dst[..5], b"crash");
        assert_eq!(checked_copy(Some(&mut dst), Some(b"")), Ok(0));
    }

    #[test]
    fn test_checked_parse_port() {
        assert_eq!(checked_parse_port(Some("8126")), Ok(8126));
        assert_eq!(checked_parse_port(Some(" 443 ")), Ok(443));
        assert!(matches!(
            checked_parse_port(Some("http")),
            Err(ArgumentError::Parse(_))
        ));
    }
}
