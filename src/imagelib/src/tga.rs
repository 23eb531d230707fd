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

//! Minimal TGA codec: uncompressed true-color (type 2), 24/32 bpp.
//! Screenshots are lossless in this container.

const TGA_TYPE_TRUECOLOR: u8 = 2;
const TGA_DESC_TOP_DOWN: u8 = 0x20;

/// Encode `pixels` (RGB/RGBA rows, top-down) as an uncompressed TGA file.
pub fn encode(width: u32, height: u32, bpp: u32, pixels: &[u8]) -> Vec<u8> {
    assert!(bpp == 3 || bpp == 4);
    assert_eq!(pixels.len(), (width * height * bpp) as usize);

    let mut out = Vec::with_capacity(18 + pixels.len());
    out.extend_from_slice(&[0, 0, TGA_TYPE_TRUECOLOR, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    out.push(width as u8);
    out.push((width >> 8) as u8);
    out.push(height as u8);
    out.push((height >> 8) as u8);
    out.push((bpp * 8) as u8);
    out.push(if bpp == 4 { TGA_DESC_TOP_DOWN | 8 } else { TGA_DESC_TOP_DOWN });

    // RGB(A) -> BGR(A)
    for px in pixels.chunks(bpp as usize) {
        out.push(px[2]);
        out.push(px[1]);
        out.push(px[0]);
        if bpp == 4 {
            out.push(px[3]);
        }
    }
    out
}

/// True when the buffer plausibly starts with a supported TGA header.
pub fn sniff(bytes: &[u8]) -> bool {
    bytes.len() >= 18 && bytes[1] == 0 && bytes[2] == TGA_TYPE_TRUECOLOR
        && (bytes[16] == 24 || bytes[16] == 32)
}

/// Decode an uncompressed true-color TGA into top-down RGB(A) rows.
/// Returns `(width, height, bpp, pixels)`.
pub fn decode(bytes: &[u8]) -> Option<(u32, u32, u32, Vec<u8>)> {
    if !sniff(bytes) {
        return None;
    }
    let id_len = bytes[0] as usize;
    let width = bytes[12] as u32 | ((bytes[13] as u32) << 8);
    let height = bytes[14] as u32 | ((bytes[15] as u32) << 8);
    let bpp = (bytes[16] / 8) as u32;
    let top_down = bytes[17] & TGA_DESC_TOP_DOWN != 0;

    let data_ofs = 18 + id_len;
    let data_len = (width * height * bpp) as usize;
    if bytes.len() < data_ofs + data_len {
        return None;
    }
    let src = &bytes[data_ofs..data_ofs + data_len];

    let row_len = (width * bpp) as usize;
    let mut pixels = vec![0u8; data_len];
    for row in 0..height as usize {
        let src_row = if top_down { row } else { height as usize - 1 - row };
        let src = &src[src_row * row_len..(src_row + 1) * row_len];
        let dst = &mut pixels[row * row_len..(row + 1) * row_len];
        for (d, s) in dst.chunks_mut(bpp as usize).zip(src.chunks(bpp as usize)) {
            // BGR(A) -> RGB(A)
            d[0] = s[2];
            d[1] = s[1];
            d[2] = s[0];
            if bpp == 4 {
                d[3] = s[3];
            }
        }
    }
    Some((width, height, bpp, pixels))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_rgba() {
        let pixels: Vec<u8> = (0..4 * 3 * 2).map(|i| i as u8).collect();
        let file = encode(3, 2, 4, &pixels);
        let (w, h, bpp, decoded) = decode(&file).unwrap();
        assert_eq!((w, h, bpp), (3, 2, 4));
        assert_eq!(decoded, pixels);
    }

    #[test]
    fn round_trip_rgb() {
        let pixels: Vec<u8> = (0..3 * 2 * 2).map(|i| (i * 7) as u8).collect();
        let file = encode(2, 2, 3, &pixels);
        let (w, h, bpp, decoded) = decode(&file).unwrap();
        assert_eq!((w, h, bpp), (2, 2, 3));
        assert_eq!(decoded, pixels);
    }
}
