//! MPEG2-TSにおける時刻。

use std::fmt;

use crate::bits;

/// 27MHzのシステムクロック周波数。
pub const SYSTEM_CLOCK_FREQUENCY: u64 = 27_000_000;

/// PCR（Program Clock Reference）。
///
/// 33ビットの基準部（90kHz）と9ビットの拡張部（27MHz、0～299）からなる。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pcr {
    /// 基準部（33ビット）。
    pub base: u64,
    /// 拡張部（9ビット、300未満）。
    pub extension: u16,
}

impl Pcr {
    /// 基準部の最大値。
    pub const MAX_BASE: u64 = (1 << 33) - 1;

    /// PCRが一周する27MHzクロック数。
    pub const WRAP: u64 = (Self::MAX_BASE + 1) * 300;

    /// `Pcr`を生成する。
    ///
    /// # パニック
    ///
    /// `base`や`extension`が範囲外の際はパニックする。
    #[inline]
    pub const fn new(base: u64, extension: u16) -> Pcr {
        assert!(base <= Pcr::MAX_BASE);
        assert!(extension < 300);
        Pcr { base, extension }
    }

    /// 27MHzクロック数から`Pcr`を生成する。一周分を超える値は折り返される。
    #[inline]
    pub const fn from_ticks(ticks: u64) -> Pcr {
        let ticks = ticks % Self::WRAP;
        Pcr {
            base: ticks / 300,
            extension: (ticks % 300) as u16,
        }
    }

    /// アダプテーションフィールド内の6バイトから`Pcr`を読み取る。
    ///
    /// 拡張部が300以上の場合は`None`を返す。
    pub fn read(data: &[u8; 6]) -> Option<Pcr> {
        let base = bits::get_bits_48(data, 0, 0, 33).ok()?;
        let extension = bits::get_bits(data, 4, 7, 9).ok()? as u16;
        (extension < 300).then_some(Pcr { base, extension })
    }

    /// `Pcr`を6バイトに書き込む。予約ビットはすべて1になる。
    pub fn write(&self, data: &mut [u8; 6]) {
        // 6バイト固定なので範囲外にはならない
        let _ = bits::set_bits_48(data, 0, 0, 33, self.base);
        let _ = bits::set_bits(data, 4, 1, 6, 0b111111);
        let _ = bits::set_bits(data, 4, 7, 9, self.extension as u32);
    }

    /// 27MHzクロック数を返す。
    #[inline]
    pub const fn ticks(&self) -> u64 {
        self.base * 300 + self.extension as u64
    }
}

/// `earlier`から`later`までのPCRの差を27MHzクロック数で返す。
///
/// PCRの折り返しを考慮し、結果は常に`0..Pcr::WRAP`の範囲となる。
#[inline]
pub fn pcr_delta(later: u64, earlier: u64) -> u64 {
    (later % Pcr::WRAP + Pcr::WRAP - earlier % Pcr::WRAP) % Pcr::WRAP
}

/// `earlier`から`later`までのPCRの差を符号付きの27MHzクロック数で返す。
///
/// 差が半周を超える場合は`later`の方が前にあるものとして負の値を返す。
#[inline]
pub fn pcr_signed_delta(later: u64, earlier: u64) -> i64 {
    let delta = pcr_delta(later, earlier);
    if delta > Pcr::WRAP / 2 {
        delta as i64 - Pcr::WRAP as i64
    } else {
        delta as i64
    }
}

impl fmt::Debug for Pcr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Pcr({}:{})", self.base, self.extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcr() {
        let data = hex_literal::hex!("D2 2D 74 82 80 F9");
        let pcr = Pcr::read(&data).unwrap();
        assert_eq!(pcr, Pcr::new(7052388613, 249));
        assert_eq!(pcr.ticks(), 7052388613 * 300 + 249);
        assert_eq!(Pcr::from_ticks(pcr.ticks()), pcr);

        let mut buf = [0; 6];
        pcr.write(&mut buf);
        assert_eq!(buf, hex_literal::hex!("D2 2D 74 82 FE F9"));
        assert_eq!(Pcr::read(&buf), Some(pcr));

        // 拡張部が300以上
        assert_eq!(Pcr::read(&hex_literal::hex!("00 00 00 00 01 2C")), None);
        assert_eq!(
            Pcr::read(&hex_literal::hex!("00 00 00 00 01 2B")),
            Some(Pcr::new(0, 299)),
        );
    }

    #[test]
    fn test_pcr_delta() {
        assert_eq!(pcr_delta(2_000_000, 1_000_000), 1_000_000);
        assert_eq!(pcr_delta(100, Pcr::WRAP - 100), 200);
        assert_eq!(pcr_delta(0, 0), 0);
        assert_eq!(Pcr::from_ticks(Pcr::WRAP + 1), Pcr::new(0, 1));

        assert_eq!(pcr_signed_delta(2_100_000, 2_000_000), 100_000);
        assert_eq!(pcr_signed_delta(2_000_000, 2_100_000), -100_000);
        assert_eq!(pcr_signed_delta(100, Pcr::WRAP - 100), 200);
        assert_eq!(pcr_signed_delta(Pcr::WRAP - 100, 100), -200);
    }
}
