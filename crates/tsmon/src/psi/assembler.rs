use arrayvec::ArrayVec;

use crate::packet::Packet;
use crate::pid::Pid;
use crate::utils::BytesExt;

use super::{PsiError, PsiSection, MAX_SECTION_SIZE};

/// [`Decoder`](super::Decoder)の処理結果の累計。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// 受け付けたTSパケット数。
    pub packets: u64,
    /// 重複して破棄したTSパケット数。
    pub duplicates: u64,
    /// 連続性指標の不連続を検出した回数。
    pub discontinuities: u64,
    /// 再構成に成功したセクション数。
    pub sections: u64,
    /// CRC32が一致せず破棄したセクション数。
    pub crc_errors: u64,
    /// セクション長が上限を超えて破棄したセクション数。
    pub too_long: u64,
    /// 壊れていたため破棄したセクション数。
    pub corrupted: u64,
    /// 復号しコールバックに渡したテーブル数。
    pub tables: u64,
}

/// 1つのPIDのTSパケットからセクションを再構成する。
pub(super) struct Assembler {
    max_section_size: usize,
    cc: Option<u8>,
    discontinuity: bool,
    buffer: Box<ArrayVec<u8, MAX_SECTION_SIZE>>,
    active: bool,
    need: usize,
    header_complete: bool,
    pub stats: Stats,
}

impl Assembler {
    pub fn new(max_section_size: usize) -> Assembler {
        Assembler {
            max_section_size,
            cc: None,
            discontinuity: false,
            buffer: Box::new(ArrayVec::new()),
            active: false,
            need: 0,
            header_complete: false,
            stats: Stats::default(),
        }
    }

    /// 組み立て中のセクションを破棄する。
    #[inline]
    fn drop_section(&mut self) {
        self.active = false;
    }

    /// 新しいセクションの組み立てを開始する。
    #[inline]
    fn begin_section(&mut self) {
        self.buffer.clear();
        self.active = true;
        self.need = 3;
        self.header_complete = false;
    }

    /// `packet`を処理し、完成したセクションを`sink`に渡す。
    ///
    /// `sink`の第2引数は、そのセクションの前に不連続が発生していたかどうかを表す。
    /// パケットがセクションの再構成に使われた場合は`Ok(true)`を返す。
    pub fn push<F>(&mut self, packet: &Packet, mut sink: F) -> Result<bool, PsiError>
    where
        F: FnMut(PsiSection, bool),
    {
        if !packet.is_synced() {
            log::debug!("not a ts packet");
            return Err(PsiError::NotATsPacket);
        }
        self.stats.packets += 1;

        let pid = packet.pid();
        let cc = packet.continuity_counter();
        if let Some(prev) = self.cc.replace(cc) {
            let expected = (prev + 1) & 0x0F;
            if cc == prev && !self.discontinuity {
                log::trace!("{}: {:?}", PsiError::Duplicate(cc), pid);
                self.stats.duplicates += 1;
                return Ok(false);
            }
            if cc != expected {
                let err = PsiError::Discontinuity {
                    expected,
                    received: cc,
                };
                log::debug!("{}: {:?}", err, pid);
                self.stats.discontinuities += 1;
                self.discontinuity = true;
                self.drop_section();
            }
        }

        let Some(payload) = packet.payload() else {
            return Ok(false);
        };

        let mut pos = 0;
        let mut new_pos = None;
        if packet.unit_start_indicator() {
            let Some(&pointer) = payload.first() else {
                return Ok(false);
            };
            pos = 1;
            let start = 1 + pointer as usize;
            if start < payload.len() {
                new_pos = Some(start);
            } else {
                log::debug!("pointer_field out of packet: {:?}", pid);
            }
        }

        if !self.active {
            match new_pos.take() {
                Some(start) => {
                    self.begin_section();
                    pos = start;
                }
                None => return Ok(false),
            }
        }

        while self.active {
            // ポインターフィールドより前は直前のセクションの続き
            let limit = new_pos.unwrap_or(payload.len());
            let n = std::cmp::min(limit - pos, self.need);
            let extended = self.buffer.try_extend_from_slice(&payload[pos..pos + n]);
            // needはmax_section_size（MAX_SECTION_SIZE以下）までしか積まない
            debug_assert!(extended.is_ok(), "section buffer overflow");
            pos += n;
            self.need -= n;

            if self.need > 0 {
                match new_pos.take() {
                    Some(start) => {
                        log::debug!("unterminated psi section: {:?}", pid);
                        self.stats.corrupted += 1;
                        self.begin_section();
                        pos = start;
                        continue;
                    }
                    None => break,
                }
            }

            if !self.header_complete {
                self.header_complete = true;
                let section_length = (self.buffer[1..=2].read_be_16() & 0x0FFF) as usize;
                if section_length > self.max_section_size - 3 {
                    log::debug!(
                        "{}: {:?}",
                        PsiError::SectionTooLong(section_length + 3),
                        pid
                    );
                    self.stats.too_long += 1;
                    self.drop_section();
                    if let Some(start) = new_pos.take() {
                        self.begin_section();
                        pos = start;
                    }
                } else {
                    self.need = section_length;
                }
                continue;
            }

            self.active = false;
            self.finish_section(pid, &mut sink);

            // 後続のセクション
            if new_pos.is_none() && pos < payload.len() && payload[pos] != 0xFF {
                new_pos = Some(pos);
            }
            if let Some(start) = new_pos.take() {
                self.begin_section();
                pos = start;
            }
        }

        Ok(true)
    }

    fn finish_section<F>(&mut self, pid: Pid, sink: &mut F)
    where
        F: FnMut(PsiSection, bool),
    {
        match PsiSection::parse(&self.buffer) {
            Ok(section) => {
                self.stats.sections += 1;
                let discontinuity = std::mem::take(&mut self.discontinuity);
                sink(section, discontinuity);
            }
            Err(e @ PsiError::BadCrc32) => {
                log::debug!("{}: {:?}", e, pid);
                self.stats.crc_errors += 1;
            }
            Err(e) => {
                log::debug!("{}: {:?}", e, pid);
                self.stats.corrupted += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PACKET_SIZE, SYNC_BYTE};

    const PAT: [u8; 16] = hex_literal::hex!("00 B0 0D 00 01 C1 00 00 00 01 F0 00 2A B1 04 B2");

    fn packet(pusi: bool, cc: u8, payload: &[u8]) -> Packet {
        let mut packet = Packet([0xFF; PACKET_SIZE]);
        packet.0[..4].copy_from_slice(&[SYNC_BYTE, (pusi as u8) << 6, 0x00, 0x10 | cc]);
        packet.0[4..4 + payload.len()].copy_from_slice(payload);
        packet
    }

    fn collect(assembler: &mut Assembler, packet: &Packet) -> Vec<(PsiSection, bool)> {
        let mut sections = Vec::new();
        assembler
            .push(packet, |section, disc| sections.push((section, disc)))
            .unwrap();
        sections
    }

    #[test]
    fn test_single_packet() {
        let mut assembler = Assembler::new(MAX_SECTION_SIZE);
        let pkt = packet(true, 0, &[&[0x00][..], &PAT].concat());
        let sections = collect(&mut assembler, &pkt);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].0.bytes(), &PAT[..]);
        assert!(!sections[0].1);
        assert_eq!(assembler.stats.sections, 1);
    }

    #[test]
    fn test_not_ts_packet() {
        let mut assembler = Assembler::new(MAX_SECTION_SIZE);
        let mut pkt = packet(true, 0, &[&[0x00][..], &PAT].concat());
        pkt.0[0] = 0x00;
        assert_eq!(assembler.push(&pkt, |_, _| {}), Err(PsiError::NotATsPacket));
        assert_eq!(assembler.stats.packets, 0);
    }

    #[test]
    fn test_duplicate() {
        let mut assembler = Assembler::new(MAX_SECTION_SIZE);
        let pkt = packet(true, 3, &[&[0x00][..], &PAT].concat());
        assert_eq!(collect(&mut assembler, &pkt).len(), 1);
        assert_eq!(assembler.push(&pkt, |_, _| panic!()), Ok(false));
        assert_eq!(assembler.stats.duplicates, 1);

        let pkt = packet(true, 4, &[&[0x00][..], &PAT].concat());
        assert_eq!(collect(&mut assembler, &pkt).len(), 1);
    }

    #[test]
    fn test_multi_packet() {
        let section = PsiSection::new_long(0x02, 1, 2, true, 0, 0, &[0xAB; 500]);
        let bytes = section.bytes();
        let mut assembler = Assembler::new(MAX_SECTION_SIZE);

        let first = packet(true, 0, &[&[0x00][..], &bytes[..183]].concat());
        let second = packet(false, 1, &bytes[183..183 + 184]);
        let third = packet(false, 2, &bytes[183 + 184..]);
        assert!(collect(&mut assembler, &first).is_empty());
        assert!(collect(&mut assembler, &second).is_empty());
        let sections = collect(&mut assembler, &third);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].0, section);
    }

    #[test]
    fn test_discontinuity() {
        let section = PsiSection::new_long(0x02, 1, 2, true, 0, 0, &[0xAB; 500]);
        let bytes = section.bytes();
        let mut assembler = Assembler::new(MAX_SECTION_SIZE);

        let first = packet(true, 0, &[&[0x00][..], &bytes[..183]].concat());
        let third = packet(false, 2, &bytes[183 + 184..]);
        assert!(collect(&mut assembler, &first).is_empty());
        // 2番目のパケットが欠落
        assert!(collect(&mut assembler, &third).is_empty());
        assert_eq!(assembler.stats.discontinuities, 1);

        // 不連続直後は同じ連続性指標でも重複扱いしない
        let again = packet(true, 2, &[&[0x00][..], &PAT].concat());
        let sections = collect(&mut assembler, &again);
        assert_eq!(sections.len(), 1);
        assert!(sections[0].1);
        assert_eq!(assembler.stats.duplicates, 0);

        let next = packet(true, 3, &[&[0x00][..], &PAT].concat());
        let sections = collect(&mut assembler, &next);
        assert!(!sections[0].1);
    }

    #[test]
    fn test_pointer_field() {
        // 前のセクションの末尾と次のセクションが同じパケットに入る
        let section = PsiSection::new_long(0x02, 1, 2, true, 0, 0, &[0xCD; 190]);
        let bytes = section.bytes();
        let mut assembler = Assembler::new(MAX_SECTION_SIZE);

        let first = packet(true, 0, &[&[0x00][..], &bytes[..183]].concat());
        let tail = &bytes[183..];
        let second = packet(
            true,
            1,
            &[&[tail.len() as u8][..], tail, &PAT].concat(),
        );
        assert!(collect(&mut assembler, &first).is_empty());
        let sections = collect(&mut assembler, &second);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].0, section);
        assert_eq!(sections[1].0.bytes(), &PAT[..]);
    }

    #[test]
    fn test_back_to_back_sections() {
        let mut assembler = Assembler::new(MAX_SECTION_SIZE);
        let pkt = packet(true, 0, &[&[0x00][..], &PAT, &PAT, &PAT].concat());
        assert_eq!(collect(&mut assembler, &pkt).len(), 3);
    }

    #[test]
    fn test_crc_error() {
        let mut broken = PAT;
        broken[10] ^= 0x10;
        let mut assembler = Assembler::new(MAX_SECTION_SIZE);
        let pkt = packet(true, 0, &[&[0x00][..], &broken, &PAT].concat());
        let sections = collect(&mut assembler, &pkt);
        assert_eq!(sections.len(), 1);
        assert_eq!(assembler.stats.crc_errors, 1);
    }

    #[test]
    fn test_too_long() {
        let mut assembler = Assembler::new(1024);
        // section_length = 0x3FE (1022) > 1024 - 3
        let long = hex_literal::hex!("00 B3 FE 00 01 C1 00 00");
        let pkt = packet(true, 0, &[&[0x00][..], &long].concat());
        assert!(collect(&mut assembler, &pkt).is_empty());
        assert_eq!(assembler.stats.too_long, 1);

        // ヘッダの完成と同じパケットで次のセクションが始まっていればそちらを組み立てる
        let mut assembler = Assembler::new(1024);
        let mut payload = vec![182];
        payload.extend_from_slice(&[0xFF; 182]);
        payload.push(long[0]);
        let first = packet(true, 0, &payload);
        assert!(collect(&mut assembler, &first).is_empty());
        let second = packet(true, 1, &[&[0x02][..], &long[1..3], &PAT].concat());
        let sections = collect(&mut assembler, &second);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].0.bytes(), &PAT[..]);
        assert_eq!(assembler.stats.too_long, 1);
    }

    #[test]
    fn test_max_size_section() {
        let section = PsiSection::new_long(0x80, 1, 0, true, 0, 0, &[0x33; MAX_SECTION_SIZE - 12]);
        assert_eq!(section.bytes().len(), MAX_SECTION_SIZE);

        let mut cc = 0;
        let packets = super::super::packetize(&[section.clone()], Pid::PAT, &mut cc);
        let mut assembler = Assembler::new(MAX_SECTION_SIZE);
        let mut sections = Vec::new();
        for pkt in &packets {
            assembler
                .push(pkt, |section, _| sections.push(section))
                .unwrap();
        }
        assert_eq!(sections, [section]);
        assert_eq!(assembler.stats.too_long, 0);
    }

    #[test]
    fn test_unterminated_section() {
        let section = PsiSection::new_long(0x02, 1, 2, true, 0, 0, &[0xAB; 500]);
        let bytes = section.bytes();
        let mut assembler = Assembler::new(MAX_SECTION_SIZE);

        let first = packet(true, 0, &[&[0x00][..], &bytes[..183]].concat());
        // 残りが届かないまま新しいセクションが始まる
        let second = packet(true, 1, &[&[0x02, 0xAB, 0xAB][..], &PAT].concat());
        assert!(collect(&mut assembler, &first).is_empty());
        let sections = collect(&mut assembler, &second);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].0.bytes(), &PAT[..]);
        assert_eq!(assembler.stats.corrupted, 1);
    }

    /// ペイロードがちょうど`payload`になるよう、アダプテーションフィールドで詰め物をしたパケット。
    fn stuffed_packet(pusi: bool, cc: u8, payload: &[u8]) -> Packet {
        let mut packet = Packet([0xFF; PACKET_SIZE]);
        let afl = 184 - payload.len();
        let afc = if afl == 0 { 0x10 } else { 0x30 };
        packet.0[..4].copy_from_slice(&[SYNC_BYTE, (pusi as u8) << 6, 0x00, afc | cc]);
        if afl > 0 {
            packet.0[4] = (afl - 1) as u8;
            if afl > 1 {
                packet.0[5] = 0x00;
            }
        }
        packet.0[4 + afl..].copy_from_slice(payload);
        packet
    }

    #[test]
    fn test_any_chunk_size() {
        let section = PsiSection::new_long(0x02, 1, 2, true, 0, 0, &[0x5A; 30]);
        let bytes = section.bytes();
        for chunk in 1..=bytes.len() {
            let mut assembler = Assembler::new(MAX_SECTION_SIZE);
            let mut sections = Vec::new();
            for (i, data) in bytes.chunks(chunk).enumerate() {
                let pkt = if i == 0 {
                    stuffed_packet(true, 0, &[&[0x00][..], data].concat())
                } else {
                    stuffed_packet(false, i as u8 & 0x0F, data)
                };
                assembler
                    .push(&pkt, |section, _| sections.push(section))
                    .unwrap();
            }
            assert_eq!(sections, [section.clone()], "chunk {}", chunk);
        }
    }

    #[test]
    fn test_no_payload() {
        let mut assembler = Assembler::new(MAX_SECTION_SIZE);
        let mut pkt = packet(true, 0, &[0xB7, 0x00]);
        pkt.0[3] = 0x20;
        assert_eq!(assembler.push(&pkt, |_, _| panic!()), Ok(false));
    }
}
