//! Frames in flight.
//!
//! [`FrameResources`] is the per-slot set of Vulkan objects. [`FrameScheduler`]
//! sequences one frame through any [`FrameBackend`]:
//!
//! ```text
//! wait fence[slot] -> acquire -> reset -> record -> submit -> present -> (recreate)
//! ```
//!
//! A stale acquire ends the frame before the fence is reset, so the retry on the
//! same slot waits on a fence that is still signalled.

use ash::vk;

use super::resources::GpuBuffer;
use crate::backend::traits::{AcquireOutcome, ExtentSource, FrameBackend, RendererError, RendererResult};

/// Number of frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Vulkan objects owned by one frame-in-flight slot.
pub struct FrameResources {
    device: ash::Device,
    command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub in_flight: vk::Fence,
    pub descriptor_set: vk::DescriptorSet,
    pub uniform_buffer: GpuBuffer,
}

impl FrameResources {
    pub fn new(
        device: &ash::Device,
        command_pool: vk::CommandPool,
        descriptor_set: vk::DescriptorSet,
        uniform_buffer: GpuBuffer,
    ) -> RendererResult<Self> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| RendererError::from_vk("allocate frame command buffer", e))?[0];

        let mut frame = Self {
            device: device.clone(),
            command_pool,
            command_buffer,
            image_available: vk::Semaphore::null(),
            in_flight: vk::Fence::null(),
            descriptor_set,
            uniform_buffer,
        };

        frame.image_available = unsafe {
            device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
        .map_err(|e| RendererError::from_vk("create image available semaphore", e))?;

        // Signalled so the first wait on every slot returns immediately
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        frame.in_flight = unsafe { device.create_fence(&fence_info, None) }
            .map_err(|e| RendererError::from_vk("create in-flight fence", e))?;

        Ok(frame)
    }
}

impl Drop for FrameResources {
    fn drop(&mut self) {
        unsafe {
            if self.in_flight != vk::Fence::null() {
                self.device.destroy_fence(self.in_flight, None);
            }
            if self.image_available != vk::Semaphore::null() {
                self.device.destroy_semaphore(self.image_available, None);
            }
            self.device
                .free_command_buffers(self.command_pool, &[self.command_buffer]);
        }
    }
}

/// What happened to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented { image_index: u32, recreated: bool },
    /// The swapchain was stale at acquire time; it has been rebuilt and nothing was drawn.
    Skipped,
}

/// Cycles through frame slots and drives the acquire/submit/present protocol.
#[derive(Debug)]
pub struct FrameScheduler {
    frames_in_flight: usize,
    current_slot: usize,
    frame_number: u64,
}

impl FrameScheduler {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            current_slot: 0,
            frame_number: 0,
        }
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Frames presented so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn draw_frame<B: FrameBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        window: &mut dyn ExtentSource,
    ) -> RendererResult<FrameStatus> {
        let slot = self.current_slot;

        backend.wait_for_slot(slot)?;

        let (image_index, acquire_suboptimal) = match backend.acquire_image(slot)? {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                backend.recreate_swapchain(window)?;
                window.clear_resize();
                return Ok(FrameStatus::Skipped);
            }
        };

        backend.reset_slot(slot)?;
        backend.record(slot, image_index)?;
        backend.submit(slot, image_index)?;
        let presented = backend.present(slot, image_index)?;

        log::trace!("Presented frame {} (slot {}, image {})", self.frame_number, slot, image_index);

        let recreated = if presented.needs_recreation() || acquire_suboptimal || window.resize_pending() {
            window.clear_resize();
            backend.recreate_swapchain(window)?;
            true
        } else {
            false
        };

        self.current_slot = (slot + 1) % self.frames_in_flight;
        self.frame_number += 1;

        Ok(FrameStatus::Presented {
            image_index,
            recreated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::traits::PresentOutcome;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Reset(usize),
        Record(usize, u32),
        Submit(usize, u32),
        Present(usize, u32),
        Recreate,
    }

    /// Records every call and simulates fences: a submission on a slot stays
    /// pending until the next wait on that slot.
    struct MockBackend {
        calls: Vec<Call>,
        image_count: u32,
        next_image: u32,
        acquire_results: VecDeque<AcquireOutcome>,
        present_results: VecDeque<PresentOutcome>,
        /// Frame tag of the unfinished submission on each slot.
        pending: Vec<Option<u64>>,
        submitted: u64,
        /// (slot, submission tag) observed by each fence wait.
        completed: Vec<(usize, u64)>,
    }

    impl MockBackend {
        fn new(frames_in_flight: usize, image_count: u32) -> Self {
            Self {
                calls: Vec::new(),
                image_count,
                next_image: 0,
                acquire_results: VecDeque::new(),
                present_results: VecDeque::new(),
                pending: vec![None; frames_in_flight],
                submitted: 0,
                completed: Vec::new(),
            }
        }
    }

    impl FrameBackend for MockBackend {
        fn wait_for_slot(&mut self, slot: usize) -> RendererResult<()> {
            self.calls.push(Call::Wait(slot));
            if let Some(tag) = self.pending[slot].take() {
                self.completed.push((slot, tag));
            }
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> RendererResult<AcquireOutcome> {
            self.calls.push(Call::Acquire(slot));
            if let Some(outcome) = self.acquire_results.pop_front() {
                return Ok(outcome);
            }
            let image_index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal: false,
            })
        }

        fn reset_slot(&mut self, slot: usize) -> RendererResult<()> {
            assert!(self.pending[slot].is_none(), "fence reset while work is pending");
            self.calls.push(Call::Reset(slot));
            Ok(())
        }

        fn record(&mut self, slot: usize, image_index: u32) -> RendererResult<()> {
            self.calls.push(Call::Record(slot, image_index));
            Ok(())
        }

        fn submit(&mut self, slot: usize, image_index: u32) -> RendererResult<()> {
            self.calls.push(Call::Submit(slot, image_index));
            self.pending[slot] = Some(self.submitted);
            self.submitted += 1;
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> RendererResult<PresentOutcome> {
            self.calls.push(Call::Present(slot, image_index));
            Ok(self
                .present_results
                .pop_front()
                .unwrap_or(PresentOutcome::Presented))
        }

        fn recreate_swapchain(&mut self, _window: &mut dyn ExtentSource) -> RendererResult<()> {
            self.calls.push(Call::Recreate);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockWindow {
        resized: bool,
        clears: usize,
    }

    impl ExtentSource for MockWindow {
        fn framebuffer_extent(&self) -> (u32, u32) {
            (800, 600)
        }

        fn resize_pending(&self) -> bool {
            self.resized
        }

        fn clear_resize(&mut self) {
            self.resized = false;
            self.clears += 1;
        }

        fn wait_events(&mut self) -> bool {
            true
        }
    }

    #[test]
    fn test_frame_protocol_order() {
        let mut backend = MockBackend::new(2, 3);
        let mut window = MockWindow::default();
        let mut scheduler = FrameScheduler::new(2);

        let status = scheduler.draw_frame(&mut backend, &mut window).unwrap();

        assert_eq!(
            status,
            FrameStatus::Presented {
                image_index: 0,
                recreated: false
            }
        );
        assert_eq!(
            backend.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Reset(0),
                Call::Record(0, 0),
                Call::Submit(0, 0),
                Call::Present(0, 0),
            ]
        );
        assert_eq!(scheduler.current_slot(), 1);
    }

    #[test]
    fn test_fence_wait_observes_submission_from_two_frames_back() {
        let frames_in_flight = 2;
        let mut backend = MockBackend::new(frames_in_flight, 3);
        let mut window = MockWindow::default();
        let mut scheduler = FrameScheduler::new(frames_in_flight);

        for _ in 0..7 {
            scheduler.draw_frame(&mut backend, &mut window).unwrap();
        }

        // Frame n waits on the work submitted at frame n - frames_in_flight
        let expected: Vec<(usize, u64)> = (frames_in_flight as u64..7)
            .map(|n| ((n as usize) % frames_in_flight, n - frames_in_flight as u64))
            .collect();
        assert_eq!(backend.completed, expected);
        assert_eq!(scheduler.frame_number(), 7);
    }

    #[test]
    fn test_slot_and_image_index_are_independent() {
        // Two slots over three images: the pairing drifts every frame
        let mut backend = MockBackend::new(2, 3);
        let mut window = MockWindow::default();
        let mut scheduler = FrameScheduler::new(2);

        for _ in 0..4 {
            scheduler.draw_frame(&mut backend, &mut window).unwrap();
        }

        let submits: Vec<Call> = backend
            .calls
            .iter()
            .copied()
            .filter(|call| matches!(call, Call::Submit(..)))
            .collect();
        assert_eq!(
            submits,
            vec![
                Call::Submit(0, 0),
                Call::Submit(1, 1),
                Call::Submit(0, 2),
                Call::Submit(1, 0),
            ]
        );
    }

    #[test]
    fn test_stale_acquire_skips_frame_and_retries_slot() {
        let mut backend = MockBackend::new(2, 3);
        backend.acquire_results.push_back(AcquireOutcome::OutOfDate);
        let mut window = MockWindow {
            resized: true,
            ..Default::default()
        };
        let mut scheduler = FrameScheduler::new(2);

        let status = scheduler.draw_frame(&mut backend, &mut window).unwrap();

        assert_eq!(status, FrameStatus::Skipped);
        assert_eq!(
            backend.calls,
            vec![Call::Wait(0), Call::Acquire(0), Call::Recreate]
        );
        assert_eq!(scheduler.current_slot(), 0);
        assert_eq!(scheduler.frame_number(), 0);
        assert!(!window.resized);

        backend.calls.clear();
        scheduler.draw_frame(&mut backend, &mut window).unwrap();
        assert_eq!(backend.calls[0], Call::Wait(0));
        assert!(backend.calls.contains(&Call::Submit(0, 0)));
        assert!(!backend.calls.contains(&Call::Recreate));
    }

    #[test]
    fn test_suboptimal_present_recreates_after_presenting() {
        let mut backend = MockBackend::new(2, 3);
        backend.present_results.push_back(PresentOutcome::Suboptimal);
        let mut window = MockWindow::default();
        let mut scheduler = FrameScheduler::new(2);

        let status = scheduler.draw_frame(&mut backend, &mut window).unwrap();

        assert_eq!(
            status,
            FrameStatus::Presented {
                image_index: 0,
                recreated: true
            }
        );
        assert_eq!(backend.calls[backend.calls.len() - 2], Call::Present(0, 0));
        assert_eq!(backend.calls.last(), Some(&Call::Recreate));
        assert_eq!(scheduler.current_slot(), 1);
    }

    #[test]
    fn test_out_of_date_present_recreates() {
        let mut backend = MockBackend::new(2, 3);
        backend.present_results.push_back(PresentOutcome::OutOfDate);
        let mut window = MockWindow::default();
        let mut scheduler = FrameScheduler::new(2);

        scheduler.draw_frame(&mut backend, &mut window).unwrap();
        assert_eq!(backend.calls.last(), Some(&Call::Recreate));
    }

    #[test]
    fn test_resize_flag_recreates_once() {
        let mut backend = MockBackend::new(2, 3);
        let mut window = MockWindow {
            resized: true,
            ..Default::default()
        };
        let mut scheduler = FrameScheduler::new(2);

        scheduler.draw_frame(&mut backend, &mut window).unwrap();
        scheduler.draw_frame(&mut backend, &mut window).unwrap();

        let recreations = backend.calls.iter().filter(|c| **c == Call::Recreate).count();
        assert_eq!(recreations, 1);
        assert_eq!(window.clears, 1);
    }

    #[test]
    fn test_suboptimal_acquire_still_draws() {
        let mut backend = MockBackend::new(2, 3);
        backend.acquire_results.push_back(AcquireOutcome::Acquired {
            image_index: 2,
            suboptimal: true,
        });
        let mut window = MockWindow::default();
        let mut scheduler = FrameScheduler::new(2);

        let status = scheduler.draw_frame(&mut backend, &mut window).unwrap();
        assert_eq!(
            status,
            FrameStatus::Presented {
                image_index: 2,
                recreated: true
            }
        );
        assert!(backend.calls.contains(&Call::Present(0, 2)));
    }
}
