// SPDX-License-Identifier: CEPL-1.0
//! Frames-in-flight sequencing.
//!
//! The scheduler owns one [`FrameSlot`] per frame in flight and drives a
//! [`FrameTarget`] through wait, acquire, hazard check, prepare, submit and
//! present. It never touches Vulkan directly, so the ordering rules can be
//! exercised against an in-memory target.

use std::fmt;

use tracing::{debug, trace, warn};

use crate::error::VkResult;

/// Synchronization primitives of one frame in flight.
pub trait FrameSlot {
    type Fence: Copy + PartialEq + fmt::Debug;

    /// Fence signaled when the slot's last submission completes.
    fn in_flight(&self) -> Self::Fence;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presented {
    Optimal,
    NeedsRecreate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The image was presented; `recreated` tells whether the surface was rebuilt afterwards.
    Presented { image: u32, recreated: bool },
    /// Acquisition found the surface out of date; it was rebuilt and nothing was drawn.
    Skipped,
}

/// The device side of a frame: everything the scheduler asks for, in order.
pub trait FrameTarget<S: FrameSlot> {
    fn wait_fence(&mut self, fence: S::Fence) -> VkResult<()>;
    fn reset_fence(&mut self, fence: S::Fence) -> VkResult<()>;
    fn acquire_image(&mut self, slot: &S) -> VkResult<Acquired>;

    /// Fence of the slot that last submitted work reading `image`, if any.
    fn image_in_use(&self, image: u32) -> Option<S::Fence>;
    fn set_image_in_use(&mut self, image: u32, fence: S::Fence);

    /// Refresh per-image data and make sure its command buffer is recorded.
    fn prepare_image(&mut self, image: u32) -> VkResult<()>;
    fn submit(&mut self, slot: &S, image: u32) -> VkResult<()>;

    /// Signal the slot's reset fence and consume its acquire semaphore with an
    /// empty submission. Used after `submit` failed.
    fn release_slot(&mut self, slot: &S) -> VkResult<()>;
    fn present(&mut self, slot: &S, image: u32) -> VkResult<Presented>;

    /// Idle the device and rebuild the swapchain and everything derived from it.
    fn recreate(&mut self) -> VkResult<()>;
}

pub struct FrameScheduler<S> {
    slots: Vec<S>,
    frame: usize,
}

impl<S: FrameSlot> FrameScheduler<S> {
    /// `slots` must not be empty; its length is the frame-in-flight count.
    pub fn new(slots: Vec<S>) -> Self {
        debug_assert!(!slots.is_empty());
        Self { slots, frame: 0 }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Index of the slot the next call to [`draw_frame`](Self::draw_frame) uses.
    pub fn current_frame(&self) -> usize {
        self.frame
    }

    pub fn draw_frame<T: FrameTarget<S>>(
        &mut self,
        target: &mut T,
        resized: bool,
    ) -> VkResult<FrameOutcome> {
        let slot = &self.slots[self.frame];
        let fence = slot.in_flight();

        // Bounds the CPU to at most `slots.len()` frames ahead of the GPU.
        target.wait_fence(fence)?;

        let (image, suboptimal) = match target.acquire_image(slot)? {
            Acquired::Image { index, suboptimal } => (index, suboptimal),
            Acquired::OutOfDate => {
                debug!("vk: swapchain out of date on acquire");
                target.recreate()?;
                return Ok(FrameOutcome::Skipped);
            }
        };

        if let Some(busy) = target.image_in_use(image) {
            if busy != fence {
                trace!("vk: image {image} still owned by {busy:?}, waiting");
                target.wait_fence(busy)?;
            }
        }
        target.set_image_in_use(image, fence);

        target.prepare_image(image)?;

        // Reset only once a submission that signals the fence is certain.
        target.reset_fence(fence)?;
        if let Err(e) = target.submit(slot, image) {
            // A reset fence with nothing queued would block every later wait on it.
            if let Err(release) = target.release_slot(slot) {
                warn!("vk: could not release frame slot after failed submit: {release}");
            }
            return Err(e);
        }
        let presented = target.present(slot, image)?;

        self.frame = (self.frame + 1) % self.slots.len();

        let recreated = suboptimal || presented == Presented::NeedsRecreate || resized;
        if recreated {
            debug!(suboptimal, resized, "vk: recreating swapchain after present");
            target.recreate()?;
        }
        Ok(FrameOutcome::Presented { image, recreated })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use ash::vk;

    use super::*;
    use crate::error::VkError;

    #[derive(Debug)]
    struct MockSlot(usize);

    impl FrameSlot for MockSlot {
        type Fence = usize;

        fn in_flight(&self) -> usize {
            self.0
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Event {
        Wait(usize),
        Reset(usize),
        Acquire(usize),
        Prepare(u32),
        Submit { slot: usize, image: u32 },
        Release(usize),
        Present(u32),
        Recreate,
    }

    /// GPU stand-in: a fence is signaled until reset, and completes every
    /// submission tagged with it when waited on.
    struct MockDevice {
        signaled: Vec<bool>,
        outstanding: Vec<usize>,
        max_outstanding: usize,
        image_owner: Vec<Option<usize>>,
        submitted_by: Vec<Option<usize>>,
        acquires: VecDeque<Acquired>,
        presents: VecDeque<Presented>,
        next_image: u32,
        image_count: u32,
        failing_submits: usize,
        events: Vec<Event>,
    }

    impl MockDevice {
        fn new(slots: usize, image_count: u32) -> Self {
            Self {
                signaled: vec![true; slots],
                outstanding: vec![0; slots],
                max_outstanding: 0,
                image_owner: vec![None; image_count as usize],
                submitted_by: vec![None; image_count as usize],
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                next_image: 0,
                image_count,
                failing_submits: 0,
                events: Vec::new(),
            }
        }

        fn script_images(&mut self, images: &[u32]) {
            self.acquires.extend(images.iter().map(|&index| Acquired::Image {
                index,
                suboptimal: false,
            }));
        }

        fn waits(&self) -> Vec<usize> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Wait(f) => Some(*f),
                    _ => None,
                })
                .collect()
        }
    }

    impl FrameTarget<MockSlot> for MockDevice {
        fn wait_fence(&mut self, fence: usize) -> VkResult<()> {
            assert!(
                self.signaled[fence] || self.outstanding[fence] > 0,
                "wait on fence {fence} that nothing will signal"
            );
            self.events.push(Event::Wait(fence));
            self.outstanding[fence] = 0;
            self.signaled[fence] = true;
            Ok(())
        }

        fn reset_fence(&mut self, fence: usize) -> VkResult<()> {
            assert!(self.signaled[fence], "reset of a fence with pending work");
            self.events.push(Event::Reset(fence));
            self.signaled[fence] = false;
            Ok(())
        }

        fn acquire_image(&mut self, slot: &MockSlot) -> VkResult<Acquired> {
            self.events.push(Event::Acquire(slot.0));
            Ok(self.acquires.pop_front().unwrap_or_else(|| {
                let index = self.next_image;
                self.next_image = (self.next_image + 1) % self.image_count;
                Acquired::Image {
                    index,
                    suboptimal: false,
                }
            }))
        }

        fn image_in_use(&self, image: u32) -> Option<usize> {
            self.image_owner[image as usize]
        }

        fn set_image_in_use(&mut self, image: u32, fence: usize) {
            self.image_owner[image as usize] = Some(fence);
        }

        fn prepare_image(&mut self, image: u32) -> VkResult<()> {
            if let Some(slot) = self.submitted_by[image as usize] {
                assert_eq!(
                    self.outstanding[slot], 0,
                    "image {image} rewritten while slot {slot} is in flight"
                );
            }
            self.events.push(Event::Prepare(image));
            Ok(())
        }

        fn submit(&mut self, slot: &MockSlot, image: u32) -> VkResult<()> {
            assert!(!self.signaled[slot.0], "submit without fence reset");
            if self.failing_submits > 0 {
                self.failing_submits -= 1;
                return Err(VkError::Vulkan {
                    what: "vkQueueSubmit",
                    result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                });
            }
            self.outstanding[slot.0] += 1;
            self.submitted_by[image as usize] = Some(slot.0);
            self.max_outstanding = self.max_outstanding.max(self.outstanding[slot.0]);
            self.events.push(Event::Submit {
                slot: slot.0,
                image,
            });
            Ok(())
        }

        fn release_slot(&mut self, slot: &MockSlot) -> VkResult<()> {
            assert!(!self.signaled[slot.0], "release of a fence that was not reset");
            self.events.push(Event::Release(slot.0));
            self.signaled[slot.0] = true;
            Ok(())
        }

        fn present(&mut self, _slot: &MockSlot, image: u32) -> VkResult<Presented> {
            self.events.push(Event::Present(image));
            Ok(self.presents.pop_front().unwrap_or(Presented::Optimal))
        }

        fn recreate(&mut self) -> VkResult<()> {
            // Recreation idles the device.
            for fence in 0..self.signaled.len() {
                self.outstanding[fence] = 0;
                self.signaled[fence] = true;
            }
            self.image_owner.iter_mut().for_each(|o| *o = None);
            self.submitted_by.iter_mut().for_each(|o| *o = None);
            self.events.push(Event::Recreate);
            Ok(())
        }
    }

    fn scheduler(frames: usize) -> FrameScheduler<MockSlot> {
        FrameScheduler::new((0..frames).map(MockSlot).collect())
    }

    #[test]
    fn frame_index_cycles_through_every_slot() {
        let mut s = scheduler(3);
        let mut dev = MockDevice::new(3, 4);
        let mut seen = Vec::new();
        for _ in 0..9 {
            seen.push(s.current_frame());
            s.draw_frame(&mut dev, false).unwrap();
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn at_most_one_outstanding_submission_per_slot() {
        for frames in 1..=4 {
            for images in 1..=5 {
                let mut s = scheduler(frames);
                let mut dev = MockDevice::new(frames, images);
                for _ in 0..32 {
                    s.draw_frame(&mut dev, false).unwrap();
                }
                assert_eq!(dev.max_outstanding, 1, "F={frames} images={images}");
            }
        }
    }

    #[test]
    fn reclaimed_image_waits_for_its_previous_owner() {
        let mut s = scheduler(2);
        let mut dev = MockDevice::new(2, 3);
        dev.script_images(&[0, 1, 2, 0, 1]);

        for _ in 0..3 {
            s.draw_frame(&mut dev, false).unwrap();
        }
        dev.events.clear();

        // Frame 3 runs on slot 1 but claims image 0, last used by slot 0.
        s.draw_frame(&mut dev, false).unwrap();
        assert_eq!(dev.waits(), vec![1, 0]);
        assert_eq!(
            dev.events.iter().position(|e| *e == Event::Wait(0)).unwrap() + 1,
            dev.events.iter().position(|e| *e == Event::Prepare(0)).unwrap()
        );
        dev.events.clear();

        // Frame 4 runs on slot 0 and claims image 1, last used by slot 1.
        s.draw_frame(&mut dev, false).unwrap();
        assert_eq!(dev.waits(), vec![0, 1]);
    }

    #[test]
    fn own_slot_fence_is_not_waited_twice() {
        let mut s = scheduler(2);
        let mut dev = MockDevice::new(2, 2);
        for _ in 0..4 {
            dev.events.clear();
            s.draw_frame(&mut dev, false).unwrap();
            assert_eq!(dev.waits().len(), 1);
        }
    }

    #[test]
    fn out_of_date_acquire_recreates_without_advancing() {
        let mut s = scheduler(2);
        let mut dev = MockDevice::new(2, 3);
        dev.acquires.push_back(Acquired::OutOfDate);

        let outcome = s.draw_frame(&mut dev, false).unwrap();
        assert_eq!(outcome, FrameOutcome::Skipped);
        assert_eq!(s.current_frame(), 0);
        assert_eq!(
            dev.events,
            vec![Event::Wait(0), Event::Acquire(0), Event::Recreate]
        );

        // The slot's fence was never reset, so the retry does not deadlock.
        let outcome = s.draw_frame(&mut dev, false).unwrap();
        assert!(matches!(outcome, FrameOutcome::Presented { recreated: false, .. }));
        assert_eq!(s.current_frame(), 1);
    }

    #[test]
    fn suboptimal_present_or_resize_recreates_after_presenting() {
        let mut s = scheduler(2);
        let mut dev = MockDevice::new(2, 3);

        dev.presents.push_back(Presented::NeedsRecreate);
        let outcome = s.draw_frame(&mut dev, false).unwrap();
        assert_eq!(
            outcome,
            FrameOutcome::Presented {
                image: 0,
                recreated: true
            }
        );
        let n = dev.events.len();
        assert_eq!(dev.events[n - 2], Event::Present(0));
        assert_eq!(dev.events[n - 1], Event::Recreate);
        assert_eq!(s.current_frame(), 1);

        dev.events.clear();
        let outcome = s.draw_frame(&mut dev, true).unwrap();
        assert!(matches!(outcome, FrameOutcome::Presented { recreated: true, .. }));
        assert_eq!(dev.events.last(), Some(&Event::Recreate));

        dev.events.clear();
        dev.acquires.push_back(Acquired::Image {
            index: 2,
            suboptimal: true,
        });
        let outcome = s.draw_frame(&mut dev, false).unwrap();
        assert_eq!(
            outcome,
            FrameOutcome::Presented {
                image: 2,
                recreated: true
            }
        );
        assert!(dev.events.contains(&Event::Present(2)));
    }

    #[test]
    fn submit_follows_wait_reset_order() {
        let mut s = scheduler(1);
        let mut dev = MockDevice::new(1, 2);
        s.draw_frame(&mut dev, false).unwrap();
        assert_eq!(
            dev.events,
            vec![
                Event::Wait(0),
                Event::Acquire(0),
                Event::Prepare(0),
                Event::Reset(0),
                Event::Submit { slot: 0, image: 0 },
                Event::Present(0),
            ]
        );
    }

    #[test]
    fn failed_submit_releases_the_slot_fence() {
        let mut s = scheduler(2);
        let mut dev = MockDevice::new(2, 3);
        dev.script_images(&[0, 0]);
        dev.failing_submits = 1;

        let err = s.draw_frame(&mut dev, false).unwrap_err();
        assert!(matches!(err, VkError::Vulkan { what: "vkQueueSubmit", .. }));
        assert_eq!(dev.events.last(), Some(&Event::Release(0)));
        assert!(dev.signaled[0]);
        assert_eq!(s.current_frame(), 0);
        assert!(!dev.events.iter().any(|e| matches!(e, Event::Present(_))));

        // The retry waits on the same fence and reclaims the same image.
        dev.events.clear();
        let outcome = s.draw_frame(&mut dev, false).unwrap();
        assert_eq!(
            outcome,
            FrameOutcome::Presented {
                image: 0,
                recreated: false
            }
        );
        assert_eq!(dev.waits(), vec![0]);
        assert!(dev.events.contains(&Event::Submit { slot: 0, image: 0 }));
    }
}
