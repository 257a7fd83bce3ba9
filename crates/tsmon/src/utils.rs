/// バイト列用拡張トレイト。
pub trait BytesExt {
    /// 先頭からビッグエンディアンで16ビット符号無し整数を読み込む。
    ///
    /// 長さが2未満の場合はパニックする。
    fn read_be_16(&self) -> u16;

    /// 先頭からビッグエンディアンで32ビット符号無し整数を読み込む。
    ///
    /// 長さが4未満の場合はパニックする。
    fn read_be_32(&self) -> u32;
}

impl BytesExt for [u8] {
    #[inline]
    fn read_be_16(&self) -> u16 {
        u16::from_be_bytes([self[0], self[1]])
    }

    #[inline]
    fn read_be_32(&self) -> u32 {
        u32::from_be_bytes([self[0], self[1], self[2], self[3]])
    }
}

/// 要素数`N`のヒープに確保される配列を、`f`を呼び出した戻り値で生成する。
pub fn boxed_array<T, const N: usize, F>(f: F) -> Box<[T; N]>
where
    F: FnMut(usize) -> T,
{
    let slice = (0..N).map(f).collect::<Vec<T>>().into_boxed_slice();
    match slice.try_into() {
        Ok(array) => array,
        // 要素数は`N`で固定
        Err(_) => unreachable!(),
    }
}
