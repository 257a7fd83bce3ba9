use std::collections::hash_map::Entry;
use std::marker::PhantomData;

use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::packet::Packet;
use crate::utils::boxed_array;

use super::assembler::{Assembler, Stats};
use super::{PsiError, PsiSection, PsiTable, MAX_SECTION_SIZE};

/// [`Decoder`]の設定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderOptions {
    /// 受け付けるセクションの最大長（ヘッダを含む）。
    ///
    /// [`MAX_SECTION_SIZE`]を超える値は[`MAX_SECTION_SIZE`]に丸められる。
    pub max_section_size: usize,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        DecoderOptions {
            max_section_size: MAX_SECTION_SIZE,
        }
    }
}

type NewSubtableHandler = Box<dyn FnMut(&mut Subtables, u8, u16) + Send>;

/// 1つのPIDに対応する、PSI/SIのデコーダー。
///
/// TSパケットからセクションを再構成し、登録されたサブテーブルに振り分ける。
///
/// # サンプル
///
/// ```
/// use tsmon::psi::table::Pat;
/// use tsmon::psi::Decoder;
///
/// let mut decoder = Decoder::new();
/// decoder
///     .attach(Pat::TABLE_ID, 0x0001, |pat: Pat| {
///         println!("{} programs", pat.programs.len());
///     })
///     .unwrap();
/// ```
pub struct Decoder {
    assembler: Assembler,
    subtables: Subtables,
    new_subtable: Option<NewSubtableHandler>,
    tables: u64,
}

impl Decoder {
    /// 既定の設定で`Decoder`を生成する。
    #[inline]
    pub fn new() -> Decoder {
        Decoder::with_options(DecoderOptions::default())
    }

    /// `options`で`Decoder`を生成する。
    pub fn with_options(options: DecoderOptions) -> Decoder {
        let max_section_size = if options.max_section_size > MAX_SECTION_SIZE {
            log::warn!(
                "max_section_size {} exceeds {}",
                options.max_section_size,
                MAX_SECTION_SIZE
            );
            MAX_SECTION_SIZE
        } else {
            // ヘッダ3バイト未満にはできない
            options.max_section_size.max(3)
        };

        Decoder {
            assembler: Assembler::new(max_section_size),
            subtables: Subtables::default(),
            new_subtable: None,
            tables: 0,
        }
    }

    /// TSパケットを処理する。
    ///
    /// 同期バイトが不正な場合は[`PsiError::NotATsPacket`]を返す。
    /// パケットのペイロードがセクションの再構成に使われた場合は`Ok(true)`、
    /// 重複やペイロードがないなどの理由で使われなかった場合は`Ok(false)`を返す。
    ///
    /// セクションごとの異常は戻り値ではなく[`Decoder::stats`]に計上される。
    pub fn packet_push(&mut self, packet: &Packet) -> Result<bool, PsiError> {
        let Decoder {
            assembler,
            subtables,
            new_subtable,
            tables,
        } = self;
        assembler.push(packet, |section, discontinuity| {
            if discontinuity {
                subtables.set_discontinuity();
            }
            if dispatch(subtables, new_subtable, section) {
                *tables += 1;
            }
        })
    }

    /// 再構成済みの`section`を直接サブテーブルに振り分ける。
    ///
    /// テーブルが完成しコールバックが呼ばれた場合は`true`を返す。
    pub fn gather(&mut self, section: PsiSection) -> bool {
        let delivered = dispatch(&mut self.subtables, &mut self.new_subtable, section);
        if delivered {
            self.tables += 1;
        }
        delivered
    }

    /// `(table_id, extension)`にサブテーブルを登録する。
    ///
    /// テーブルが完成するたびに`callback`が呼ばれる。
    /// 既に登録されている場合は[`PsiError::AlreadyAttached`]を返す。
    #[inline]
    pub fn attach<T, F>(
        &mut self,
        table_id: u8,
        extension: u16,
        callback: F,
    ) -> Result<(), PsiError>
    where
        T: PsiTable + 'static,
        F: FnMut(T) + Send + 'static,
    {
        self.subtables.attach(table_id, extension, callback)
    }

    /// `(table_id, extension)`のサブテーブルを登録解除する。
    ///
    /// 登録されていなかった場合は`false`を返す。
    #[inline]
    pub fn detach(&mut self, table_id: u8, extension: u16) -> bool {
        self.subtables.detach(table_id, extension)
    }

    /// 登録されているサブテーブルを返す。
    #[inline]
    pub fn subtables(&mut self) -> &mut Subtables {
        &mut self.subtables
    }

    /// 未登録の`(table_id, extension)`のセクションを受け取った際に呼ばれる関数を設定する。
    ///
    /// 関数内で[`Subtables::attach`]を呼ぶと、そのセクションは登録したサブテーブルに渡される。
    pub fn set_new_subtable_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Subtables, u8, u16) + Send + 'static,
    {
        self.new_subtable = Some(Box::new(handler));
    }

    /// 処理結果の累計を返す。
    pub fn stats(&self) -> Stats {
        Stats {
            tables: self.tables,
            ..self.assembler.stats
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder::new()
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("subtables", &self.subtables)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn dispatch(
    subtables: &mut Subtables,
    new_subtable: &mut Option<NewSubtableHandler>,
    section: PsiSection,
) -> bool {
    let key = (section.table_id, section.extension);
    if !subtables.0.contains_key(&key) {
        if let Some(handler) = new_subtable {
            handler(subtables, key.0, key.1);
        }
    }

    match subtables.0.get_mut(&key) {
        Some(subtable) => subtable.gather(section),
        None => {
            log::trace!(
                "no subtable for table_id 0x{:02X}, extension 0x{:04X}",
                key.0,
                key.1
            );
            false
        }
    }
}

/// `(table_id, extension)`をキーとするサブテーブルの集合。
#[derive(Default)]
pub struct Subtables(FxHashMap<(u8, u16), Box<dyn Subtable + Send>>);

impl Subtables {
    /// `(table_id, extension)`にサブテーブルを登録する。
    ///
    /// 既に登録されている場合は[`PsiError::AlreadyAttached`]を返す。
    pub fn attach<T, F>(
        &mut self,
        table_id: u8,
        extension: u16,
        callback: F,
    ) -> Result<(), PsiError>
    where
        T: PsiTable + 'static,
        F: FnMut(T) + Send + 'static,
    {
        match self.0.entry((table_id, extension)) {
            Entry::Occupied(_) => Err(PsiError::AlreadyAttached {
                table_id,
                extension,
            }),
            Entry::Vacant(entry) => {
                entry.insert(Box::new(Gatherer::<T, F>::new(table_id, callback)));
                Ok(())
            }
        }
    }

    /// `(table_id, extension)`のサブテーブルを登録解除する。
    pub fn detach(&mut self, table_id: u8, extension: u16) -> bool {
        let removed = self.0.remove(&(table_id, extension)).is_some();
        if !removed {
            log::debug!(
                "no such subtable: table_id 0x{:02X}, extension 0x{:04X}",
                table_id,
                extension
            );
        }
        removed
    }

    /// `(table_id, extension)`にサブテーブルが登録されているかどうかを返す。
    #[inline]
    pub fn contains(&self, table_id: u8, extension: u16) -> bool {
        self.0.contains_key(&(table_id, extension))
    }

    /// 登録されているサブテーブルの数を返す。
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// サブテーブルが登録されていないかどうかを返す。
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn set_discontinuity(&mut self) {
        for subtable in self.0.values_mut() {
            subtable.set_discontinuity();
        }
    }
}

impl std::fmt::Debug for Subtables {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// セクションを集めてテーブルを完成させるもの。
trait Subtable {
    /// `section`を取り込み、テーブルが完成してコールバックを呼んだ場合は`true`を返す。
    fn gather(&mut self, section: PsiSection) -> bool;

    /// 次に受け取るセクションの前に不連続が発生したことを設定する。
    fn set_discontinuity(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Building {
    extension: u16,
    version: u8,
    last_number: u8,
}

struct Gatherer<T, F> {
    table_id: u8,
    callback: F,
    discontinuity: bool,
    building: Option<Building>,
    sections: Box<[Option<PsiSection>; 256]>,
    /// 最後に完成したテーブルの`(version, current_next)`。
    delivered: Option<(u8, bool)>,
    _table: PhantomData<fn() -> T>,
}

impl<T: PsiTable, F: FnMut(T)> Gatherer<T, F> {
    fn new(table_id: u8, callback: F) -> Gatherer<T, F> {
        Gatherer {
            table_id,
            callback,
            discontinuity: false,
            building: None,
            sections: boxed_array(|_| None),
            delivered: None,
            _table: PhantomData,
        }
    }

    fn reset(&mut self) {
        self.building = None;
        self.sections.iter_mut().for_each(|s| *s = None);
    }

    fn is_complete(&self, last_number: u8) -> bool {
        let last_number = last_number as usize;
        let mut i = 0;
        while i <= last_number {
            let Some(section) = &self.sections[i] else {
                return false;
            };
            if i == last_number {
                return true;
            }

            match T::segment_last_section_number(section) {
                // セグメントの残りは欠番
                Some(segment_last) if segment_last as usize == i => i = (i / 8 + 1) * 8,
                _ => i += 1,
            }
        }
        false
    }
}

impl<T: PsiTable, F: FnMut(T)> Subtable for Gatherer<T, F> {
    fn gather(&mut self, section: PsiSection) -> bool {
        if std::mem::take(&mut self.discontinuity) {
            // 組み立て中のテーブルは破棄するが、完成済みのバージョンは保持する
            self.reset();
        } else if let Some(building) = self.building {
            let reason = if building.extension != section.extension {
                Some("table_id_extension")
            } else if building.version != section.version {
                Some("version_number")
            } else if building.last_number != section.last_number {
                Some("last_section_number")
            } else {
                None
            };
            if let Some(reason) = reason {
                log::debug!(
                    "'{}' differs whereas no discontinuity has occurred (table_id 0x{:02X})",
                    reason,
                    self.table_id
                );
                self.reset();
            }
        }

        let version = Some((section.version, section.current_next));
        if self.building.is_none() && self.delivered == version {
            log::trace!(
                "ignoring already decoded section {} (table_id 0x{:02X}, version {})",
                section.number,
                self.table_id,
                section.version
            );
            return false;
        }

        if section.number > section.last_number {
            log::debug!(
                "section_number {} exceeds last_section_number {} (table_id 0x{:02X})",
                section.number,
                section.last_number,
                self.table_id
            );
            return false;
        }

        let building = *self.building.get_or_insert(Building {
            extension: section.extension,
            version: section.version,
            last_number: section.last_number,
        });
        let number = section.number as usize;
        if self.sections[number].is_some() {
            log::trace!(
                "overwrite section number {} (table_id 0x{:02X})",
                number,
                self.table_id
            );
        }
        self.sections[number] = Some(section);

        if !self.is_complete(building.last_number) {
            return false;
        }

        let sections: SmallVec<[PsiSection; 1]> = self.sections[..=building.last_number as usize]
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        self.reset();

        let version = (sections[0].version, sections[0].current_next);
        match T::read(&sections) {
            Some(table) => {
                self.delivered = Some(version);
                (self.callback)(table);
                true
            }
            None => {
                log::debug!("failed to decode table 0x{:02X}", self.table_id);
                false
            }
        }
    }

    #[inline]
    fn set_discontinuity(&mut self) {
        self.discontinuity = true;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::pid::Pid;
    use crate::psi::packetize;

    /// セクションのペイロードをそのまま保持するテーブル。
    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Raw {
        version: u8,
        numbers: Vec<u8>,
    }

    impl PsiTable for Raw {
        fn read(sections: &[PsiSection]) -> Option<Raw> {
            Some(Raw {
                version: sections[0].version,
                numbers: sections.iter().map(|s| s.number).collect(),
            })
        }

        fn write(&self) -> Vec<PsiSection> {
            let last = *self.numbers.last().unwrap_or(&0);
            self.numbers
                .iter()
                .map(|&n| PsiSection::new_long(0x42, 1, self.version, true, n, last, &[n]))
                .collect()
        }
    }

    /// セグメントを持つテーブル。ペイロードの先頭がセグメントの最終セクション番号。
    #[derive(Debug)]
    struct Segmented(Vec<u8>);

    impl PsiTable for Segmented {
        fn read(sections: &[PsiSection]) -> Option<Segmented> {
            Some(Segmented(sections.iter().map(|s| s.number).collect()))
        }

        fn write(&self) -> Vec<PsiSection> {
            Vec::new()
        }

        fn segment_last_section_number(section: &PsiSection) -> Option<u8> {
            section.payload().first().copied()
        }
    }

    fn section(version: u8, number: u8, last: u8) -> PsiSection {
        PsiSection::new_long(0x42, 1, version, true, number, last, &[number])
    }

    fn attach_raw(decoder: &mut Decoder) -> Arc<Mutex<Vec<Raw>>> {
        let tables = Arc::new(Mutex::new(Vec::new()));
        let t = tables.clone();
        decoder
            .attach(0x42, 1, move |raw: Raw| t.lock().unwrap().push(raw))
            .unwrap();
        tables
    }

    #[test]
    fn test_attach_detach() {
        let mut decoder = Decoder::new();
        let _ = attach_raw(&mut decoder);
        assert_eq!(
            decoder.attach(0x42, 1, |_: Raw| {}),
            Err(PsiError::AlreadyAttached {
                table_id: 0x42,
                extension: 1
            }),
        );
        assert!(decoder.subtables().contains(0x42, 1));
        assert_eq!(decoder.subtables().len(), 1);
        assert!(decoder.detach(0x42, 1));
        assert!(!decoder.detach(0x42, 1));
        assert!(decoder.subtables().is_empty());
    }

    #[test]
    fn test_attach_twice_keeps_first() {
        let mut decoder = Decoder::new();
        let tables = attach_raw(&mut decoder);
        assert!(decoder
            .attach(0x42, 1, |_: Raw| panic!("replaced callback"))
            .is_err());

        assert!(decoder.gather(section(0, 0, 0)));
        assert_eq!(tables.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_gap_without_segments() {
        let mut decoder = Decoder::new();
        let tables = attach_raw(&mut decoder);

        assert!(!decoder.gather(section(0, 0, 8)));
        assert!(!decoder.gather(section(0, 8, 8)));
        assert!(tables.lock().unwrap().is_empty());
    }

    #[test]
    fn test_gather_out_of_order() {
        let mut decoder = Decoder::new();
        let tables = attach_raw(&mut decoder);

        assert!(!decoder.gather(section(1, 2, 2)));
        assert!(!decoder.gather(section(1, 0, 2)));
        assert!(decoder.gather(section(1, 1, 2)));
        assert_eq!(
            *tables.lock().unwrap(),
            [Raw {
                version: 1,
                numbers: vec![0, 1, 2]
            }]
        );

        // 同じバージョンの再送は無視される
        assert!(!decoder.gather(section(1, 0, 2)));
        assert!(!decoder.gather(section(1, 1, 2)));
        assert!(!decoder.gather(section(1, 2, 2)));
        assert_eq!(tables.lock().unwrap().len(), 1);

        // バージョンが変われば再度完成する
        assert!(!decoder.gather(section(2, 0, 1)));
        assert!(decoder.gather(section(2, 1, 1)));
        assert_eq!(tables.lock().unwrap().len(), 2);
        assert_eq!(decoder.stats().tables, 2);
    }

    #[test]
    fn test_gather_reinit() {
        let mut decoder = Decoder::new();
        let tables = attach_raw(&mut decoder);

        assert!(!decoder.gather(section(1, 0, 1)));
        // 組み立て中にバージョンが変わると破棄してやり直す
        assert!(!decoder.gather(section(2, 1, 1)));
        assert!(decoder.gather(section(2, 0, 1)));
        assert_eq!(tables.lock().unwrap()[0].version, 2);

        // 範囲外のセクション番号は無視される
        let bad = PsiSection::new_long(0x42, 1, 3, true, 2, 1, &[]);
        assert!(!decoder.gather(bad));
    }

    #[test]
    fn test_discontinuity_keeps_delivered() {
        let mut decoder = Decoder::new();
        let tables = attach_raw(&mut decoder);

        let raw = Raw {
            version: 5,
            numbers: vec![0, 1],
        };
        let mut cc = 0x0F;
        let packets = packetize(&raw.write(), Pid::new(0x100), &mut cc);
        for packet in &packets {
            decoder.packet_push(packet).unwrap();
        }
        assert_eq!(tables.lock().unwrap().len(), 1);

        // 不連続の後、同じバージョンの再送は重複として無視される
        let mut cc = 0x05;
        let packets = packetize(&raw.write(), Pid::new(0x100), &mut cc);
        for packet in &packets {
            decoder.packet_push(packet).unwrap();
        }
        assert_eq!(tables.lock().unwrap().len(), 1);
        assert_eq!(decoder.stats().discontinuities, 1);
        assert_eq!(decoder.stats().sections, 4);
    }

    #[test]
    fn test_discontinuity_drops_partial() {
        let mut decoder = Decoder::new();
        let tables = attach_raw(&mut decoder);

        let raw = Raw {
            version: 0,
            numbers: vec![0, 1],
        };
        let sections = raw.write();
        let mut cc = 0;
        let first = packetize(&sections[..1], Pid::new(0x100), &mut cc);
        decoder.packet_push(&first[0]).unwrap();

        // 2番目のセクションの前で不連続
        cc += 3;
        let second = packetize(&sections[1..], Pid::new(0x100), &mut cc);
        decoder.packet_push(&second[0]).unwrap();
        assert!(tables.lock().unwrap().is_empty());

        let all = packetize(&sections, Pid::new(0x100), &mut cc);
        for packet in &all {
            decoder.packet_push(packet).unwrap();
        }
        assert_eq!(tables.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_new_subtable_handler() {
        let mut decoder = Decoder::new();
        let tables = Arc::new(Mutex::new(Vec::new()));
        let t = tables.clone();
        decoder.set_new_subtable_handler(move |subtables, table_id, extension| {
            let t = t.clone();
            if table_id == 0x42 {
                subtables
                    .attach(table_id, extension, move |raw: Raw| t.lock().unwrap().push(raw))
                    .unwrap();
            }
        });

        assert!(decoder.gather(section(0, 0, 0)));
        assert!(!decoder.gather(PsiSection::new_long(0x43, 1, 0, true, 0, 0, &[])));
        assert_eq!(tables.lock().unwrap().len(), 1);
        assert!(decoder.subtables().contains(0x42, 1));
        assert!(!decoder.subtables().contains(0x43, 1));
    }

    #[test]
    fn test_segmented() {
        let mut decoder = Decoder::new();
        let tables = Arc::new(Mutex::new(Vec::new()));
        let t = tables.clone();
        decoder
            .attach(0x42, 1, move |seg: Segmented| t.lock().unwrap().push(seg.0))
            .unwrap();

        // セグメント0は0のみ、セグメント1は8と9
        let seg = |number, segment_last| {
            PsiSection::new_long(0x42, 1, 0, true, number, 9, &[segment_last])
        };
        assert!(!decoder.gather(seg(0, 0)));
        assert!(!decoder.gather(seg(9, 9)));
        assert!(decoder.gather(seg(8, 9)));
        assert_eq!(*tables.lock().unwrap(), [vec![0_u8, 8, 9]]);
    }

    #[test]
    fn test_max_section_size() {
        let mut decoder = Decoder::with_options(DecoderOptions {
            max_section_size: 64,
        });
        let tables = attach_raw(&mut decoder);

        let big = PsiSection::new_long(0x42, 1, 0, true, 0, 0, &[0; 100]);
        let mut cc = 0;
        for packet in packetize(&[big], Pid::new(0x100), &mut cc) {
            decoder.packet_push(&packet).unwrap();
        }
        assert!(tables.lock().unwrap().is_empty());
        assert_eq!(decoder.stats().too_long, 1);

        let mut bad = packetize(&[section(0, 0, 0)], Pid::new(0x100), &mut cc).remove(0);
        bad.0[0] = 0x48;
        assert_eq!(decoder.packet_push(&bad), Err(PsiError::NotATsPacket));
    }
}
