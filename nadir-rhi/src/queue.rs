use ash::vk;

/// A queue wrapper that carries its family index and family capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Queue {
    handle: vk::Queue,
    family_index: u32,
    index: u32,
    flags: vk::QueueFlags,
    can_present: bool,
}

impl Queue {
    pub fn new(handle: vk::Queue, family_index: u32, index: u32, flags: vk::QueueFlags, can_present: bool) -> Self {
        Self { handle, family_index, index, flags, can_present }
    }

    pub fn handle(&self) -> vk::Queue { self.handle }

    pub fn family_index(&self) -> u32 { self.family_index }

    pub fn index(&self) -> u32 { self.index }

    pub fn flags(&self) -> vk::QueueFlags { self.flags }

    pub fn can_present(&self) -> bool { self.can_present }
}
