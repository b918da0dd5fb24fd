/// 帧计数器，决定当前使用哪一个 frame in flight 的 slot
pub struct FrameCounter {
    /// 当前的帧序号，一直累加
    frame_id: u64,
    fif_count: usize,
}
// new & init
impl FrameCounter {
    pub fn new(init_frame_id: u64, fif_count: usize) -> Self {
        Self {
            frame_id: init_frame_id,
            fif_count: fif_count.max(1),
        }
    }
}
// update
impl FrameCounter {
    #[inline]
    pub fn next_frame(&mut self) {
        self.frame_id = self.frame_id.wrapping_add(1);
    }
}
// getters
impl FrameCounter {
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }
    #[inline]
    pub fn fif_count(&self) -> usize {
        self.fif_count
    }
    #[inline]
    pub fn frame_index(&self) -> usize {
        (self.frame_id % self.fif_count as u64) as usize
    }
    /// A, B, C ...
    #[inline]
    pub fn frame_label(&self) -> char {
        (b'A' + (self.frame_index() % 26) as u8) as char
    }
    #[inline]
    pub fn frame_name(&self) -> String {
        format!("[F{}{}]", self.frame_id, self.frame_label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_slots_cycle() {
        let mut counter = FrameCounter::new(0, 3);
        let labels = (0..4)
            .map(|_| {
                let label = counter.frame_label();
                counter.next_frame();
                label
            })
            .collect::<String>();
        assert_eq!(labels, "ABCA");
        assert_eq!(counter.frame_name(), "[F4B]");
    }

    #[test]
    fn test_zero_fif_is_clamped() {
        let counter = FrameCounter::new(5, 0);
        assert_eq!(counter.fif_count(), 1);
        assert_eq!(counter.frame_index(), 0);
    }
}
