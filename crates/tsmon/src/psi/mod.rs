//! PSI/SIのセクションを再構成し、テーブルとして復号するためのモジュール。
//!
//! TSパケットは[`Decoder::packet_push`]に渡すとセクション単位に再構成され、
//! CRC32を検証した上で`(table_id, table_id_extension)`ごとに登録されたサブテーブルへ振り分けられる。
//! サブテーブルは全セクションが揃った時点で[`PsiTable::read`]によりテーブルを復号し、
//! 登録時のコールバックへ渡す。

mod assembler;
mod demux;
pub mod table;

use thiserror::Error;

use crate::packet::{Packet, PACKET_SIZE, SYNC_BYTE};
use crate::pid::Pid;
use crate::utils::BytesExt;

pub use assembler::Stats;
pub use demux::{Decoder, DecoderOptions, Subtables};

/// セクションの最大長（ヘッダを含む）。プライベートセクションの上限である。
pub const MAX_SECTION_SIZE: usize = 4096;
/// PSIセクションの最大長（ヘッダを含む）。
pub const MAX_PSI_SECTION_SIZE: usize = 1024;

/// PSIの処理で発生するエラー。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PsiError {
    /// 同期バイトが不正でTSパケットではない。
    #[error("not a ts packet")]
    NotATsPacket,

    /// 連続性指標が不連続である。
    #[error("ts discontinuity (received {received}, expected {expected})")]
    Discontinuity {
        /// 期待された連続性指標。
        expected: u8,
        /// 受信した連続性指標。
        received: u8,
    },

    /// 同じ連続性指標のパケットを重複して受信した。
    #[error("ts duplicate (received {0})")]
    Duplicate(u8),

    /// セクション長が上限を超えている。
    ///
    /// 内包する`usize`にはヘッダを含むセクション長が入る。
    #[error("psi section too long ({0} bytes)")]
    SectionTooLong(usize),

    /// CRC32が一致しない。
    #[error("bad crc32")]
    BadCrc32,

    /// セクションに最低限必要なバイト数がなく、壊れたセクションである。
    #[error("corrupt section")]
    Corrupted,

    /// 同じキーのサブテーブルが既に登録されている。
    #[error("subtable 0x{table_id:02X}/0x{extension:04X} is already attached")]
    AlreadyAttached {
        /// テーブル識別。
        table_id: u8,
        /// テーブル識別拡張。
        extension: u16,
    },
}

/// PSI/SIのセクション。
///
/// 再構成と検証が済んだセクションであり、内容は変更されない。
#[derive(Clone, PartialEq, Eq)]
pub struct PsiSection {
    /// テーブル識別。
    pub table_id: u8,
    /// セクションシンタクス指示。
    pub syntax_indicator: bool,
    /// プライベート指示。
    pub private_indicator: bool,
    /// テーブル識別拡張。セクションシンタクスがない場合は0。
    pub extension: u16,
    /// バージョン番号（5ビット）。セクションシンタクスがない場合は0。
    pub version: u8,
    /// カレントネクスト指示。セクションシンタクスがない場合は`true`。
    pub current_next: bool,
    /// セクション番号。
    pub number: u8,
    /// 最終セクション番号。
    pub last_number: u8,
    bytes: Box<[u8]>,
}

impl PsiSection {
    /// `table_id`のセクションがCRC32を持つかどうかを返す。
    ///
    /// セクションシンタクスを持つセクションに加え、TOTとsplice_info_sectionはCRC32を持つ。
    /// TDTとSTはCRC32を持たない。
    pub fn has_crc32(table_id: u8, syntax_indicator: bool) -> bool {
        match table_id {
            // TDT・ST
            0x70 | 0x72 => false,
            // TOT・SIS
            0x73 | 0xFC => true,
            _ => syntax_indicator,
        }
    }

    /// ちょうど1セクション分の`buf`をパースする。
    ///
    /// `buf`の長さはセクション長から求まる長さと一致している必要がある。
    pub fn parse(buf: &[u8]) -> Result<PsiSection, PsiError> {
        if buf.len() < 3 {
            return Err(PsiError::Corrupted);
        }

        let table_id = buf[0];
        let syntax_indicator = buf[1] & 0b10000000 != 0;
        let private_indicator = buf[1] & 0b01000000 != 0;
        let section_length = (buf[1..=2].read_be_16() & 0x0FFF) as usize;
        if buf.len() != 3 + section_length {
            return Err(PsiError::Corrupted);
        }

        let has_crc32 = Self::has_crc32(table_id, syntax_indicator);
        if has_crc32 && buf.len() < 3 + 4 {
            return Err(PsiError::Corrupted);
        }
        if syntax_indicator && buf.len() < 3 + 5 + if has_crc32 { 4 } else { 0 } {
            return Err(PsiError::Corrupted);
        }
        if has_crc32 && !crate::crc32::calc(buf) {
            return Err(PsiError::BadCrc32);
        }

        let mut section = PsiSection {
            table_id,
            syntax_indicator,
            private_indicator,
            extension: 0,
            version: 0,
            current_next: true,
            number: 0,
            last_number: 0,
            bytes: buf.into(),
        };
        if syntax_indicator {
            section.extension = buf[3..=4].read_be_16();
            section.version = (buf[5] & 0b00111110) >> 1;
            section.current_next = buf[5] & 0b00000001 != 0;
            section.number = buf[6];
            section.last_number = buf[7];
        }

        Ok(section)
    }

    /// セクションシンタクスを持つセクションを生成する。
    ///
    /// ヘッダとCRC32は自動で付加される。
    pub fn new_long(
        table_id: u8,
        extension: u16,
        version: u8,
        current_next: bool,
        number: u8,
        last_number: u8,
        payload: &[u8],
    ) -> PsiSection {
        debug_assert!(payload.len() <= MAX_SECTION_SIZE - 3 - 5 - 4);

        let mut bytes = Vec::with_capacity(3 + 5 + payload.len() + 4);
        bytes.push(table_id);
        bytes.extend_from_slice(&u16::to_be_bytes(
            0b1011_0000_0000_0000 | (5 + payload.len() + 4) as u16 & 0x0FFF,
        ));
        bytes.extend_from_slice(&u16::to_be_bytes(extension));
        bytes.push(0b11000000 | (version & 0x1F) << 1 | current_next as u8);
        bytes.push(number);
        bytes.push(last_number);
        bytes.extend_from_slice(payload);
        let crc = crate::crc32::compute(&bytes);
        bytes.extend_from_slice(&u32::to_be_bytes(crc));

        PsiSection {
            table_id,
            syntax_indicator: true,
            private_indicator: false,
            extension,
            version: version & 0x1F,
            current_next,
            number,
            last_number,
            bytes: bytes.into_boxed_slice(),
        }
    }

    /// セクションシンタクスを持たないセクションを生成する。
    ///
    /// CRC32は`table_id`が必要とする場合のみ付加される。
    pub fn new_short(table_id: u8, private_indicator: bool, payload: &[u8]) -> PsiSection {
        let has_crc32 = Self::has_crc32(table_id, false);
        let crc_len = if has_crc32 { 4 } else { 0 };
        debug_assert!(payload.len() <= MAX_SECTION_SIZE - 3 - crc_len);

        let mut bytes = Vec::with_capacity(3 + payload.len() + crc_len);
        bytes.push(table_id);
        bytes.extend_from_slice(&u16::to_be_bytes(
            (private_indicator as u16) << 14
                | 0b0011_0000_0000_0000
                | (payload.len() + crc_len) as u16 & 0x0FFF,
        ));
        bytes.extend_from_slice(payload);
        if has_crc32 {
            let crc = crate::crc32::compute(&bytes);
            bytes.extend_from_slice(&u32::to_be_bytes(crc));
        }

        PsiSection {
            table_id,
            syntax_indicator: false,
            private_indicator,
            extension: 0,
            version: 0,
            current_next: true,
            number: 0,
            last_number: 0,
            bytes: bytes.into_boxed_slice(),
        }
    }

    /// ヘッダとCRC32を含むセクション全体を返す。
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// ヘッダとCRC32を除いたセクションのデータを返す。
    #[inline]
    pub fn payload(&self) -> &[u8] {
        let start = if self.syntax_indicator { 8 } else { 3 };
        let end = if self.has_crc() {
            self.bytes.len() - 4
        } else {
            self.bytes.len()
        };
        &self.bytes[start..end]
    }

    /// CRC32を持つ場合はその値を返す。
    #[inline]
    pub fn crc32(&self) -> Option<u32> {
        self.has_crc()
            .then(|| self.bytes[self.bytes.len() - 4..].read_be_32())
    }

    #[inline]
    fn has_crc(&self) -> bool {
        Self::has_crc32(self.table_id, self.syntax_indicator)
    }
}

impl std::fmt::Debug for PsiSection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PsiSection")
            .field("table_id", &self.table_id)
            .field("extension", &self.extension)
            .field("version", &self.version)
            .field("current_next", &self.current_next)
            .field("number", &self.number)
            .field("last_number", &self.last_number)
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

/// PSI/SIのテーブルを表すトレイト。
///
/// サブテーブルとして[`Decoder::attach`]で登録すると、全セクションが揃った時点で`read`が呼ばれる。
pub trait PsiTable: Sized {
    /// セクション番号順に並んだセクションからテーブルを復号する。
    fn read(sections: &[PsiSection]) -> Option<Self>;

    /// テーブルをセクションに符号化する。
    fn write(&self) -> Vec<PsiSection>;

    /// `section`が属するセグメントの最終セクション番号を返す。
    ///
    /// セグメント単位で送出されるテーブル（EIT）はこれを実装することで、
    /// セグメント間のセクション番号の欠番を許容して全セクションの受信を判定する。
    fn segment_last_section_number(section: &PsiSection) -> Option<u8> {
        let _ = section;
        None
    }
}

/// `sections`を`pid`のTSパケットに分割する。
///
/// 各セクションは新しいパケットから始まり、余りは0xFFで埋められる。
/// `cc`には直前に送出した連続性指標を渡し、送出後の値に更新される。
pub fn packetize(sections: &[PsiSection], pid: Pid, cc: &mut u8) -> Vec<Packet> {
    let mut packets = Vec::new();
    for section in sections {
        let mut data = section.bytes();
        let mut first = true;
        while first || !data.is_empty() {
            let mut packet = Packet([0xFF; PACKET_SIZE]);
            *cc = (*cc + 1) & 0x0F;
            packet.0[0] = SYNC_BYTE;
            packet.0[1] = (first as u8) << 6 | (pid.get() >> 8) as u8;
            packet.0[2] = pid.get() as u8;
            packet.0[3] = 0b0001_0000 | *cc;

            let mut pos = 4;
            if first {
                // pointer_field
                packet.0[pos] = 0;
                pos += 1;
            }
            let n = std::cmp::min(PACKET_SIZE - pos, data.len());
            packet.0[pos..pos + n].copy_from_slice(&data[..n]);
            data = &data[n..];

            packets.push(packet);
            first = false;
        }
    }
    packets
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const PAT: [u8; 16] = hex_literal::hex!("00 B0 0D 00 01 C1 00 00 00 01 F0 00 2A B1 04 B2");

    #[test]
    fn test_parse() {
        let section = PsiSection::parse(&PAT).unwrap();
        assert_eq!(section.table_id, 0x00);
        assert!(section.syntax_indicator);
        assert!(!section.private_indicator);
        assert_eq!(section.extension, 0x0001);
        assert_eq!(section.version, 0);
        assert!(section.current_next);
        assert_eq!(section.number, 0);
        assert_eq!(section.last_number, 0);
        assert_eq!(section.payload(), &PAT[8..12]);
        assert_eq!(section.crc32(), Some(0x2AB104B2));
        assert_eq!(section.bytes(), &PAT[..]);

        assert_eq!(
            PsiSection::new_long(0x00, 0x0001, 0, true, 0, 0, &PAT[8..12]),
            section,
        );
    }

    #[test]
    fn test_parse_err() {
        let mut broken = PAT;
        broken[15] ^= 0xFF;
        assert_matches!(PsiSection::parse(&broken), Err(PsiError::BadCrc32));

        assert_matches!(PsiSection::parse(&PAT[..2]), Err(PsiError::Corrupted));
        assert_matches!(PsiSection::parse(&PAT[..15]), Err(PsiError::Corrupted));
        // セクションシンタクスのヘッダに満たない
        let short = PsiSection::new_short(0x00, false, &[]);
        let mut bytes = short.bytes().to_vec();
        bytes[1] |= 0x80;
        assert_matches!(PsiSection::parse(&bytes), Err(PsiError::Corrupted));
    }

    #[test]
    fn test_short_section() {
        // TDTはCRC32を持たない
        let tdt = PsiSection::new_short(0x70, false, &[0xC0, 0x79, 0x12, 0x45, 0x00]);
        assert_eq!(tdt.bytes(), &hex_literal::hex!("70 30 05 C0 79 12 45 00")[..]);
        assert_eq!(tdt.crc32(), None);
        assert_eq!(tdt.payload(), &[0xC0, 0x79, 0x12, 0x45, 0x00]);
        assert_eq!(PsiSection::parse(tdt.bytes()), Ok(tdt));

        // TOTはCRC32を持つ
        let tot = PsiSection::new_short(0x73, false, &[0xC0, 0x79, 0x12, 0x45, 0x00, 0xF0, 0x00]);
        assert!(tot.crc32().is_some());
        assert_eq!(tot.payload().len(), 7);
        assert_eq!(PsiSection::parse(tot.bytes()), Ok(tot.clone()));

        let mut broken = tot.bytes().to_vec();
        broken[4] ^= 0x01;
        assert_matches!(PsiSection::parse(&broken), Err(PsiError::BadCrc32));
    }

    #[test]
    fn test_packetize() {
        let section = PsiSection::parse(&PAT).unwrap();
        let mut cc = 0x0F;
        let packets = packetize(&[section.clone(), section], Pid::PAT, &mut cc);
        assert_eq!(packets.len(), 2);
        assert_eq!(cc, 1);
        assert_eq!(packets[0].0[..5], hex_literal::hex!("47 40 00 10 00"));
        assert_eq!(packets[0].0[5..21], PAT);
        assert!(packets[0].0[21..].iter().all(|&b| b == 0xFF));
        assert_eq!(packets[1].continuity_counter(), 1);

        let big = PsiSection::new_long(0x4E, 1, 0, true, 0, 0, &[0; 400]);
        let packets = packetize(&[big], Pid::EIT, &mut cc);
        assert_eq!(packets.len(), 3);
        assert!(packets[0].unit_start_indicator());
        assert!(!packets[1].unit_start_indicator());
        assert_eq!(packets[2].continuity_counter(), 4);
    }
}
