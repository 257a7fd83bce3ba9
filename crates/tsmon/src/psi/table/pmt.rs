use crate::bits;
use crate::pid::Pid;
use crate::psi::{PsiSection, PsiTable};

use super::DescriptorBlock;

/// 番組を構成するストリームの定義。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStream {
    /// ストリーム形式種別。
    pub stream_type: u8,
    /// エレメンタリーPID。
    pub elementary_pid: Pid,
    /// 記述子の塊。
    pub descriptors: DescriptorBlock,
}

/// PMT（Program Map Table）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pmt {
    /// 放送番組番号識別。
    pub program_number: u16,
    /// バージョン番号。
    pub version: u8,
    /// カレントネクスト指示。
    pub current_next: bool,
    /// PCRのPID。
    pub pcr_pid: Pid,
    /// 記述子の塊。
    pub descriptors: DescriptorBlock,
    /// ストリームの定義を格納する配列。
    pub streams: Vec<PmtStream>,
}

impl Pmt {
    /// PMTのテーブルID。
    pub const TABLE_ID: u8 = 0x02;
}

impl PsiTable for Pmt {
    fn read(sections: &[PsiSection]) -> Option<Pmt> {
        let first = sections.first()?;
        if first.table_id != Self::TABLE_ID {
            log::debug!("invalid Pmt::table_id");
            return None;
        }
        if !first.syntax_indicator {
            log::debug!("invalid Pmt::syntax");
            return None;
        }

        let mut pcr_pid = Pid::NULL;
        let mut descriptors = DescriptorBlock::default();
        let mut streams = Vec::new();
        for (i, section) in sections.iter().enumerate() {
            let data = section.payload();
            if data.len() < 4 {
                log::debug!("invalid Pmt");
                return None;
            }

            let Some((block, mut data)) = DescriptorBlock::read(&data[2..]) else {
                log::debug!("invalid Pmt::descriptors");
                return None;
            };
            if i == 0 {
                pcr_pid = Pid::read(&section.payload()[0..=1]);
            }
            descriptors.0.extend(block.0);

            while !data.is_empty() {
                if data.len() < 5 {
                    log::debug!("invalid PmtStream");
                    return None;
                }

                let stream_type = data[0];
                let elementary_pid = Pid::read(&data[1..=2]);
                let Some((descriptors, rem)) = DescriptorBlock::read(&data[3..]) else {
                    log::debug!("invalid PmtStream::descriptors");
                    return None;
                };
                data = rem;

                streams.push(PmtStream {
                    stream_type,
                    elementary_pid,
                    descriptors,
                });
            }
        }

        Some(Pmt {
            program_number: first.extension,
            version: first.version,
            current_next: first.current_next,
            pcr_pid,
            descriptors,
            streams,
        })
    }

    fn write(&self) -> Vec<PsiSection> {
        let mut payload = vec![0_u8; 2];
        let _ = bits::set_bits(&mut payload, 0, 0, 3, 0b111);
        let _ = bits::set_bits(&mut payload, 0, 3, 13, self.pcr_pid.get() as u32);
        self.descriptors.write(&mut payload);

        for stream in &self.streams {
            let pos = payload.len();
            payload.extend_from_slice(&[stream.stream_type, 0, 0]);
            let _ = bits::set_bits(&mut payload, pos + 1, 0, 3, 0b111);
            let pid = stream.elementary_pid.get() as u32;
            let _ = bits::set_bits(&mut payload, pos + 1, 3, 13, pid);
            stream.descriptors.write(&mut payload);
        }

        vec![PsiSection::new_long(
            Self::TABLE_ID,
            self.program_number,
            self.version,
            self.current_next,
            0,
            0,
            &payload,
        )]
    }
}
