//! バイト列中の任意のビット位置にある整数フィールドを読み書きする。
//!
//! ビット位置はすべてMSBファースト（バイトの最上位ビットが0ビット目）で数える。
//! フィールドの位置は`byte_offset * 8 + start_bit`で表される絶対ビット位置で決まるため、
//! `start_bit`は8以上でも構わない。

use thiserror::Error;

/// ビットフィールドの読み書きで発生するエラー。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BitsError {
    /// 要求されたビット長が関数の扱える範囲を超えている。
    #[error("bit field of {bits} bits at bit {shift} is out of range")]
    Range {
        /// 要求されたビット長。
        bits: u32,
        /// バイト境界からのビット位置。
        shift: u32,
    },

    /// フィールドがバッファの終端を超えている。
    #[error("bit field exceeds the buffer")]
    OutOfBounds,
}

/// フィールドを含む最小の窓。
struct Window {
    /// 窓の先頭バイト位置。
    offset: usize,
    /// 窓の先頭からフィールドまでのビット数。
    shift: u32,
    /// 窓のバイト数。
    len: usize,
}

impl Window {
    fn new(
        buf_len: usize,
        byte_offset: usize,
        start_bit: u32,
        bit_len: u32,
        max_len: usize,
    ) -> Result<Window, BitsError> {
        let shift = start_bit % 8;
        let range = BitsError::Range {
            bits: bit_len,
            shift,
        };
        if bit_len as usize > max_len * 8 {
            return Err(range);
        }
        let len = ((shift + bit_len + 7) / 8) as usize;
        if len > max_len {
            return Err(range);
        }

        let offset = byte_offset
            .checked_add((start_bit / 8) as usize)
            .ok_or(BitsError::OutOfBounds)?;
        match offset.checked_add(len) {
            Some(end) if end <= buf_len => {}
            _ => return Err(BitsError::OutOfBounds),
        }

        Ok(Window { offset, shift, len })
    }

    /// 窓の内容をビッグエンディアンで`u64`に読み込む。
    fn load(&self, buf: &[u8]) -> u64 {
        buf[self.offset..self.offset + self.len]
            .iter()
            .fold(0, |acc, &b| acc << 8 | b as u64)
    }

    fn store(&self, buf: &mut [u8], mut value: u64) {
        for b in buf[self.offset..self.offset + self.len].iter_mut().rev() {
            *b = value as u8;
            value >>= 8;
        }
    }

    /// フィールドの下位側にある窓内の余りビット数。
    #[inline]
    fn tail(&self, bit_len: u32) -> u32 {
        self.len as u32 * 8 - self.shift - bit_len
    }
}

#[inline]
fn mask(bit_len: u32) -> u64 {
    if bit_len >= 64 {
        u64::MAX
    } else {
        (1 << bit_len) - 1
    }
}

/// `buf`から`bit_len`ビットのフィールドを読み取る。
///
/// 読み取りは最大4バイトの窓で行われ、フィールドが窓に収まらない場合
/// （`start_bit % 8 + bit_len`が32を超える場合）は[`BitsError::Range`]を返す。
/// `bit_len`が0の場合は常に0を返す。
///
/// # サンプル
///
/// ```
/// use tsmon::bits::get_bits;
///
/// let buf = [0x47, 0x40, 0x11, 0x10];
/// // PID
/// assert_eq!(get_bits(&buf, 1, 3, 13), Ok(0x0011));
/// // 連続性指標
/// assert_eq!(get_bits(&buf, 3, 4, 4), Ok(0x0));
/// ```
pub fn get_bits(
    buf: &[u8],
    byte_offset: usize,
    start_bit: u32,
    bit_len: u32,
) -> Result<u32, BitsError> {
    if bit_len == 0 {
        return Ok(0);
    }
    if bit_len > 32 {
        return Err(BitsError::Range {
            bits: bit_len,
            shift: start_bit % 8,
        });
    }
    let window = Window::new(buf.len(), byte_offset, start_bit, bit_len, 4)?;
    let value = window.load(buf) >> window.tail(bit_len) & mask(bit_len);
    Ok(value as u32)
}

/// `buf`から最大48ビットのフィールドを読み取る。
///
/// 読み取りは最大7バイトの窓で行われる。`bit_len`が48を超える場合は[`BitsError::Range`]を返す。
pub fn get_bits_48(
    buf: &[u8],
    byte_offset: usize,
    start_bit: u32,
    bit_len: u32,
) -> Result<u64, BitsError> {
    if bit_len == 0 {
        return Ok(0);
    }
    if bit_len > 48 {
        return Err(BitsError::Range {
            bits: bit_len,
            shift: start_bit % 8,
        });
    }
    let window = Window::new(buf.len(), byte_offset, start_bit, bit_len, 7)?;
    Ok(window.load(buf) >> window.tail(bit_len) & mask(bit_len))
}

/// `buf`から最大64ビットのフィールドを読み取る。
///
/// 32ビットを超えるフィールドは先頭32ビットと残りのビットに分けて読み取り、連結して返す。
pub fn get_bits_64(
    buf: &[u8],
    byte_offset: usize,
    start_bit: u32,
    bit_len: u32,
) -> Result<u64, BitsError> {
    if bit_len > 64 {
        return Err(BitsError::Range {
            bits: bit_len,
            shift: start_bit % 8,
        });
    }

    if bit_len <= 32 {
        return match get_bits(buf, byte_offset, start_bit, bit_len) {
            Ok(value) => Ok(value as u64),
            // 5バイト目にかかる場合
            Err(BitsError::Range { .. }) => get_bits_48(buf, byte_offset, start_bit, bit_len),
            Err(e) => Err(e),
        };
    }

    let rest = bit_len - 32;
    let high = get_bits_48(buf, byte_offset, start_bit, 32)?;
    let low_offset = byte_offset.checked_add(4).ok_or(BitsError::OutOfBounds)?;
    let low = get_bits_48(buf, low_offset, start_bit, rest)?;
    Ok(high << rest | low)
}

fn put(
    buf: &mut [u8],
    byte_offset: usize,
    start_bit: u32,
    bit_len: u32,
    value: u64,
) -> Result<(), BitsError> {
    if bit_len == 0 {
        return Ok(());
    }
    let window = Window::new(buf.len(), byte_offset, start_bit, bit_len, 7)?;
    let tail = window.tail(bit_len);
    let field = mask(bit_len) << tail;
    let current = window.load(buf);
    window.store(buf, current & !field | (value << tail) & field);
    Ok(())
}

/// `value`の下位`bit_len`ビットを`buf`に書き込む。
///
/// フィールド外のビットは変更されない。`bit_len`は32以下でなければならない。
///
/// # サンプル
///
/// ```
/// use tsmon::bits::{get_bits, set_bits};
///
/// let mut buf = [0xFF; 4];
/// set_bits(&mut buf, 1, 3, 13, 0x0100).unwrap();
/// assert_eq!(buf, [0xFF, 0xE1, 0x00, 0xFF]);
/// assert_eq!(get_bits(&buf, 1, 3, 13), Ok(0x0100));
/// ```
pub fn set_bits(
    buf: &mut [u8],
    byte_offset: usize,
    start_bit: u32,
    bit_len: u32,
    value: u32,
) -> Result<(), BitsError> {
    if bit_len > 32 {
        return Err(BitsError::Range {
            bits: bit_len,
            shift: start_bit % 8,
        });
    }
    put(buf, byte_offset, start_bit, bit_len, value as u64)
}

/// `value`の下位`bit_len`ビットを`buf`に書き込む。`bit_len`は48以下でなければならない。
pub fn set_bits_48(
    buf: &mut [u8],
    byte_offset: usize,
    start_bit: u32,
    bit_len: u32,
    value: u64,
) -> Result<(), BitsError> {
    if bit_len > 48 {
        return Err(BitsError::Range {
            bits: bit_len,
            shift: start_bit % 8,
        });
    }
    put(buf, byte_offset, start_bit, bit_len, value)
}
