//! Frame statistics exposed to the host

use std::time::Duration;

/// Counters of the last rendered frame plus running totals
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderStatistics {
    pub frame_count: u64,
    /// Nodes that issued draw calls in the last frame
    pub nodes_rendered: usize,
    /// Nodes across all buckets in the last frame
    pub nodes_bucketed: usize,
    pub triangles: usize,
    /// Command lists replayed from parallel recording in the last frame
    pub command_lists: usize,
    pub frustum_test_time: Duration,
    pub frame_time: Duration,
}

impl RenderStatistics {
    /// Reset per-frame counters and advance the frame count
    pub fn begin_frame(&mut self) {
        self.frame_count += 1;
        self.nodes_rendered = 0;
        self.nodes_bucketed = 0;
        self.triangles = 0;
        self.command_lists = 0;
        self.frustum_test_time = Duration::ZERO;
        self.frame_time = Duration::ZERO;
    }

    /// Frames per second implied by the last frame time
    pub fn fps(&self) -> f32 {
        let seconds = self.frame_time.as_secs_f32();
        if seconds > 0.0 {
            1.0 / seconds
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_frame_resets_counters() {
        let mut stats = RenderStatistics {
            nodes_rendered: 10,
            triangles: 300,
            frame_time: Duration::from_millis(20),
            ..Default::default()
        };
        assert!((stats.fps() - 50.0).abs() < 0.01);
        stats.begin_frame();
        assert_eq!(stats.frame_count, 1);
        assert_eq!(stats.nodes_rendered, 0);
        assert_eq!(stats.fps(), 0.0);
    }
}
