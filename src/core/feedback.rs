//! Queued min-mip feedback.
//!
//! The renderer resolves one feedback buffer per frame: a byte per region
//! holding the coarsest mip the sampler wanted there. A resource keeps one
//! slot per swap buffer so a feedback can be queued every frame; the
//! feedback pass consumes the newest slot whose render fence has completed.

use crate::core::backend::FenceValue;

/// CPU-side resolved feedback: byte-per-region wanted-mip grid, row-major
#[derive(Debug, Clone)]
pub struct FeedbackMap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl FeedbackMap {
    pub fn new(width: u32, height: u32, fill: u8) -> Self {
        Self {
            width,
            height,
            data: vec![fill; (width * height) as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.data[(y * self.width + x) as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, wanted_mip: u8) {
        self.data[(y * self.width + x) as usize] = wanted_mip;
    }

    pub fn fill(&mut self, wanted_mip: u8) {
        self.data.fill(wanted_mip);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn copy_from(&mut self, resolved: &[u8]) {
        debug_assert_eq!(resolved.len(), self.data.len());
        self.data.copy_from_slice(resolved);
    }
}

#[derive(Debug)]
struct FeedbackSlot {
    render_fence: FenceValue,
    queued: bool,
    map: FeedbackMap,
}

/// Per-resource feedback slot ring, one slot per swap buffer
#[derive(Debug)]
pub struct FeedbackQueue {
    slots: Vec<FeedbackSlot>,
    write_index: usize,
}

impl FeedbackQueue {
    pub fn new(swap_buffers: usize, width: u32, height: u32, default_mip: u8) -> Self {
        let slots = (0..swap_buffers)
            .map(|_| FeedbackSlot {
                render_fence: 0,
                queued: false,
                map: FeedbackMap::new(width, height, default_mip),
            })
            .collect();
        Self { slots, write_index: 0 }
    }

    /// Record a resolved feedback buffer, usable once `render_fence` has
    /// completed. Overwrites the oldest slot when the renderer runs ahead.
    pub fn queue(&mut self, resolved: &[u8], render_fence: FenceValue) {
        self.write_index = (self.write_index + 1) % self.slots.len();
        let slot = &mut self.slots[self.write_index];
        slot.map.copy_from(resolved);
        slot.render_fence = render_fence;
        slot.queued = true;
    }

    /// Consume and return the queued feedback with the largest fence value
    /// <= `completed`, if any. Every examined completed slot is marked
    /// consumed, including slots superseded by a newer fence.
    pub fn take_latest(&mut self, completed: FenceValue) -> Option<&FeedbackMap> {
        let mut best: Option<usize> = None;
        let mut best_fence = 0;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.queued && slot.render_fence <= completed {
                slot.queued = false;
                if best.is_none() || slot.render_fence >= best_fence {
                    best = Some(i);
                    best_fence = slot.render_fence;
                }
            }
        }
        best.map(|i| &self.slots[i].map)
    }

    /// Discard all queued feedback, e.g. on evict-all
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.queued = false;
        }
    }

    pub fn any_queued(&self) -> bool {
        self.slots.iter().any(|s| s.queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(w: u32, h: u32, v: u8) -> Vec<u8> {
        vec![v; (w * h) as usize]
    }

    #[test]
    fn test_not_ready_until_fence() {
        let mut queue = FeedbackQueue::new(2, 4, 4, 4);
        queue.queue(&resolved(4, 4, 0), 10);
        assert!(queue.take_latest(9).is_none());
        assert!(queue.any_queued());
        let map = queue.take_latest(10).unwrap();
        assert_eq!(map.get(0, 0), 0);
        assert!(!queue.any_queued());
    }

    #[test]
    fn test_newest_completed_wins() {
        let mut queue = FeedbackQueue::new(2, 2, 2, 4);
        queue.queue(&resolved(2, 2, 3), 5);
        queue.queue(&resolved(2, 2, 1), 6);
        let map = queue.take_latest(6).unwrap();
        assert_eq!(map.get(0, 0), 1);
        // the superseded slot was consumed too
        assert!(queue.take_latest(u64::MAX).is_none());
    }

    #[test]
    fn test_renderer_running_ahead_overwrites_oldest() {
        let mut queue = FeedbackQueue::new(2, 1, 1, 4);
        queue.queue(&[3], 1);
        queue.queue(&[2], 2);
        queue.queue(&[1], 3); // reuses the slot that held fence 1
        let map = queue.take_latest(3).unwrap();
        assert_eq!(map.get(0, 0), 1);
    }

    #[test]
    fn test_clear() {
        let mut queue = FeedbackQueue::new(2, 1, 1, 4);
        queue.queue(&[0], 1);
        queue.clear();
        assert!(queue.take_latest(u64::MAX).is_none());
    }
}
