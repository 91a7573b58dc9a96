/// Buffers replaced by growth, each tagged with the frame it was retired in.
/// Earlier frames may still have draws in flight that read them, so they are
/// only dropped once the caller reports that frame as complete.
#[derive(Debug)]
pub struct RetiredBuffers<B> {
    retired: Vec<(u64, B)>,
}

impl<B> Default for RetiredBuffers<B> {
    fn default() -> Self {
        Self { retired: vec![] }
    }
}

impl<B> RetiredBuffers<B> {
    pub fn retire(&mut self, buffer: B, frame: u64) {
        self.retired.push((frame, buffer));
    }

    /// Drops every buffer retired in or before `completed_frame`, returns how
    /// many were dropped.
    pub fn reclaim(&mut self, completed_frame: u64) -> usize {
        let before = self.retired.len();
        self.retired.retain(|(frame, _)| *frame > completed_frame);
        before - self.retired.len()
    }

    pub fn len(&self) -> usize {
        self.retired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retired.is_empty()
    }
}
