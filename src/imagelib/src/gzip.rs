// Copyright 2021 The ADK Developers.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded gzip inflate.
//!
//! Decompression runs against a fixed working-space budget taken from
//! configuration, so a hostile or mis-tagged payload cannot balloon memory
//! on a constrained device.

use std::fmt;
use std::io::Read;

use flate2::read::GzDecoder;

/// Inflate failures.
#[derive(Debug)]
pub enum GzipError {
    /// The stream is not valid gzip data.
    BadStream(String),
    /// Decompressed output exceeded the working-space budget.
    WorkingSpaceExceeded,
}

impl fmt::Display for GzipError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            GzipError::BadStream(ref m) => write!(f, "gzip stream error: {}", m),
            GzipError::WorkingSpaceExceeded => write!(f, "gzip working space exceeded"),
        }
    }
}

impl ::std::error::Error for GzipError {
    fn description(&self) -> &str {
        "gzip error"
    }
}

/// Inflate a gzip stream, allowing at most `working_space` bytes of output.
pub fn inflate_gzip(src: &[u8], working_space: usize) -> Result<Vec<u8>, GzipError> {
    let mut decoder = GzDecoder::new(src);
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = decoder
            .read(&mut chunk)
            .map_err(|e| GzipError::BadStream(e.to_string()))?;
        if n == 0 {
            return Ok(out);
        }
        if out.len() + n > working_space {
            return Err(GzipError::WorkingSpaceExceeded);
        }
        out.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn round_trip_within_budget() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
        let gz = deflate(&data);
        let out = inflate_gzip(&gz, 64 * 1024).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn budget_is_enforced() {
        let data = vec![0u8; 10_000];
        let gz = deflate(&data);
        match inflate_gzip(&gz, 1024) {
            Err(GzipError::WorkingSpaceExceeded) => {}
            other => panic!("expected budget breach, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn garbage_is_rejected() {
        match inflate_gzip(b"not gzip at all", 1024) {
            Err(GzipError::BadStream(_)) => {}
            other => panic!("expected stream error, got {:?}", other.map(|v| v.len())),
        }
    }
}
