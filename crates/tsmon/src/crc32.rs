//! MPEG-2で使われるCRC32。
//!
//! 生成多項式は0x04C11DB7、初期値は0xFFFFFFFFで、反転や最終XORは行わない。

const POLYNOMIAL: u32 = 0x04C11DB7;

const TABLE: [u32; 256] = {
    let mut table = [0; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80000000 != 0 {
                crc << 1 ^ POLYNOMIAL
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// `data`のCRC32を計算する。
#[inline]
pub fn compute(data: &[u8]) -> u32 {
    data.iter().fold(0xFFFFFFFF, |crc, &b| {
        crc << 8 ^ TABLE[((crc >> 24) as u8 ^ b) as usize]
    })
}

/// 末尾4バイトにCRC32を含む`data`が正しいかどうかを返す。
///
/// CRC32を含めた全体のCRC32は0になる。
#[inline]
pub fn calc(data: &[u8]) -> bool {
    compute(data) == 0
}
