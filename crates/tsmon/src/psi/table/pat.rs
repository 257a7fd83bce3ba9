use crate::bits;
use crate::pid::Pid;
use crate::psi::{PsiSection, PsiTable, MAX_PSI_SECTION_SIZE};
use crate::utils::BytesExt;

/// PMTあるいはNITのPIDの定義。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatProgram {
    /// 放送番組番号識別。0の場合はNITを表す。
    pub program_number: u16,
    /// PMTあるいはNITのPID。
    pub pid: Pid,
}

/// PAT（Program Association Table）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pat {
    /// トランスポートストリーム識別。
    pub transport_stream_id: u16,
    /// バージョン番号。
    pub version: u8,
    /// カレントネクスト指示。
    pub current_next: bool,
    /// 番組の定義を格納する配列。
    pub programs: Vec<PatProgram>,
}

impl Pat {
    /// PATのテーブルID。
    pub const TABLE_ID: u8 = 0x00;

    // 1セクションに収まる番組の数
    const PROGRAMS_PER_SECTION: usize = (MAX_PSI_SECTION_SIZE - 3 - 5 - 4) / 4;

    /// NITのPIDを返す。
    pub fn network_pid(&self) -> Option<Pid> {
        self.programs
            .iter()
            .find(|p| p.program_number == 0)
            .map(|p| p.pid)
    }
}

impl PsiTable for Pat {
    fn read(sections: &[PsiSection]) -> Option<Pat> {
        let first = sections.first()?;
        if first.table_id != Self::TABLE_ID {
            log::debug!("invalid Pat::table_id");
            return None;
        }
        if !first.syntax_indicator {
            log::debug!("invalid Pat::syntax");
            return None;
        }

        let programs = sections
            .iter()
            .flat_map(|section| section.payload().chunks_exact(4))
            .map(|chunk| PatProgram {
                program_number: chunk[0..=1].read_be_16(),
                pid: Pid::read(&chunk[2..=3]),
            })
            .collect();

        Some(Pat {
            transport_stream_id: first.extension,
            version: first.version,
            current_next: first.current_next,
            programs,
        })
    }

    fn write(&self) -> Vec<PsiSection> {
        let chunks: Vec<&[PatProgram]> = if self.programs.is_empty() {
            vec![&[]]
        } else {
            self.programs.chunks(Self::PROGRAMS_PER_SECTION).collect()
        };
        let last_number = (chunks.len() - 1) as u8;

        chunks
            .iter()
            .enumerate()
            .map(|(number, programs)| {
                let mut payload = vec![0_u8; programs.len() * 4];
                for (i, program) in programs.iter().enumerate() {
                    let pos = i * 4;
                    let number = program.program_number as u32;
                    let pid = program.pid.get() as u32;
                    let _ = bits::set_bits(&mut payload, pos, 0, 16, number);
                    let _ = bits::set_bits(&mut payload, pos + 2, 0, 3, 0b111);
                    let _ = bits::set_bits(&mut payload, pos + 2, 3, 13, pid);
                }
                PsiSection::new_long(
                    Self::TABLE_ID,
                    self.transport_stream_id,
                    self.version,
                    self.current_next,
                    number as u8,
                    last_number,
                    &payload,
                )
            })
            .collect()
    }
}
