//! GPU context management.
//!
//! [`GpuContext`] is a cheap, cloneable handle. Every resource created
//! through it keeps a clone, so the device and instance outlive all device
//! objects without any process-wide state.

use crate::buffer::{Buffer, BufferCreateInfo};
use crate::capabilities::GpuCapabilities;
use crate::command::{CommandBuffer, CommandPool};
use crate::descriptors::{DescriptorPool, DescriptorSet, DescriptorSetCreateInfo};
use crate::error::{GpuError, Result};
use crate::image::{Image, ImageCreateInfo};
use crate::instance::{
    create_instance, required_device_extensions, select_physical_device, DebugMessenger,
};
use crate::memory::GpuAllocator;
use crate::shader::{Shader, ShaderCreateInfo};
use crate::sync::Fence;
use crate::timer::GpuTimer;
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{c_char, CString};
use std::sync::Arc;
use std::thread::ThreadId;

/// Queue and command pool assigned to one host thread.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ThreadQueue {
    pub queue_index: usize,
    pub command_pool: vk::CommandPool,
}

/// Round-robin assignment of host threads to queue slots.
pub(crate) struct ThreadSlots<T> {
    assigned: HashMap<ThreadId, T>,
    next_queue: usize,
    queue_count: usize,
}

impl<T: Copy> ThreadSlots<T> {
    pub fn new(queue_count: usize) -> Self {
        Self {
            assigned: HashMap::new(),
            next_queue: 0,
            queue_count: queue_count.max(1),
        }
    }

    /// Slot for `thread`, assigning the next queue index on first use.
    pub fn get_or_assign(
        &mut self,
        thread: ThreadId,
        make: impl FnOnce(usize) -> Result<T>,
    ) -> Result<T> {
        if let Some(slot) = self.assigned.get(&thread) {
            return Ok(*slot);
        }

        let slot = make(self.next_queue)?;
        self.next_queue = (self.next_queue + 1) % self.queue_count;
        self.assigned.insert(thread, slot);
        Ok(slot)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.assigned.values()
    }
}

pub(crate) struct ContextInner {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<DebugMessenger>,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    capabilities: GpuCapabilities,
    allocator: Mutex<GpuAllocator>,
    accel_loader: Option<ash::khr::acceleration_structure::Device>,
    rt_pipeline_loader: Option<ash::khr::ray_tracing_pipeline::Device>,

    queue_family: u32,
    queues: Vec<Mutex<vk::Queue>>,
    threads: Mutex<ThreadSlots<ThreadQueue>>,
    descriptor_pool: Mutex<DescriptorPool>,
}

/// Main GPU context holding Vulkan resources.
#[derive(Clone)]
pub struct GpuContext {
    inner: Arc<ContextInner>,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.inner.device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.inner.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.inner.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.inner.capabilities
    }

    /// Index of the general (graphics + compute) queue family.
    pub fn queue_family(&self) -> u32 {
        self.inner.queue_family
    }

    /// Number of queues threads are spread over.
    pub fn queue_count(&self) -> usize {
        self.inner.queues.len()
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.inner.allocator
    }

    /// Whether the acceleration structure extensions were enabled.
    pub fn ray_tracing_enabled(&self) -> bool {
        self.inner.accel_loader.is_some()
    }

    /// Acceleration structure extension functions.
    pub fn acceleration_structure_loader(
        &self,
    ) -> Result<&ash::khr::acceleration_structure::Device> {
        self.inner.accel_loader.as_ref().ok_or_else(|| {
            GpuError::ExtensionNotSupported(
                "VK_KHR_acceleration_structure (context built without ray tracing)".to_string(),
            )
        })
    }

    /// Ray tracing pipeline extension functions.
    pub fn ray_tracing_pipeline_loader(&self) -> Result<&ash::khr::ray_tracing_pipeline::Device> {
        self.inner.rt_pipeline_loader.as_ref().ok_or_else(|| {
            GpuError::ExtensionNotSupported(
                "VK_KHR_ray_tracing_pipeline (context built without ray tracing)".to_string(),
            )
        })
    }

    /// Attach a debug name to a Vulkan object. No-op without validation.
    pub fn set_debug_name<H: vk::Handle>(&self, handle: H, name: &str) {
        let Some(debug_utils) = &self.inner.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&name);
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
            tracing::debug!("Failed to set debug name {:?}: {e}", name);
        }
    }

    /// Queue and command pool of the calling thread, assigned on first use.
    pub(crate) fn thread_queue(&self) -> Result<ThreadQueue> {
        let thread = std::thread::current().id();
        let mut threads = self.inner.threads.lock();
        threads.get_or_assign(thread, |queue_index| {
            let pool = unsafe {
                CommandPool::new(
                    &self.inner.device,
                    self.inner.queue_family,
                    vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                )?
            };
            tracing::debug!("Assigned queue {queue_index} to thread {thread:?}");
            Ok(ThreadQueue {
                queue_index,
                command_pool: pool.handle(),
            })
        })
    }

    /// Allocate a primary command buffer from the calling thread's pool.
    pub fn allocate_command_buffer(&self) -> Result<CommandBuffer> {
        let thread_queue = self.thread_queue()?;
        CommandBuffer::allocate(self.clone(), thread_queue)
    }

    /// Submit a recorded command buffer to the queue it was allocated for.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn submit(&self, cmd: &CommandBuffer, fence: Option<&Fence>) -> Result<()> {
        let raw = [cmd.raw()];
        let submit_info = vk::SubmitInfo::default().command_buffers(&raw);
        let fence = fence.map_or(vk::Fence::null(), Fence::raw);

        let queue = self.inner.queues.get(cmd.queue_index()).ok_or_else(|| {
            GpuError::InvalidState(format!("No queue with index {}", cmd.queue_index()))
        })?;
        let queue = queue.lock();
        unsafe {
            self.inner
                .device
                .queue_submit(*queue, std::slice::from_ref(&submit_info), fence)?;
        }
        Ok(())
    }

    /// Record, submit and wait for a single-use command buffer.
    pub fn one_time_submit<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&CommandBuffer) -> Result<()>,
    {
        let cmd = self.allocate_command_buffer()?;
        cmd.begin_one_time()?;
        record(&cmd)?;
        cmd.end()?;

        let fence = self.create_fence(false)?;
        self.submit(&cmd, Some(&fence))?;
        fence.wait(u64::MAX)?;
        Ok(())
    }

    /// Allocate a descriptor set with the given layout from the shared pool.
    pub(crate) fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let pool = self.inner.descriptor_pool.lock();
        let sets = unsafe { pool.allocate(&self.inner.device, &[layout])? };
        sets.into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("Descriptor pool returned no set".to_string()))
    }

    pub(crate) fn free_descriptor_set(&self, set: vk::DescriptorSet) {
        let pool = self.inner.descriptor_pool.lock();
        unsafe { pool.free(&self.inner.device, set) };
    }

    /// Create a buffer.
    pub fn create_buffer(&self, info: &BufferCreateInfo<'_>) -> Result<Buffer> {
        Buffer::new(self.clone(), info)
    }

    /// Create an image with a view and optional sampler.
    pub fn create_image(&self, info: &ImageCreateInfo<'_>) -> Result<Image> {
        Image::new(self.clone(), info)
    }

    /// Create a shader module.
    pub fn create_shader(&self, info: &ShaderCreateInfo<'_>) -> Result<Shader> {
        Shader::new(self.clone(), info)
    }

    /// Create a descriptor set laid out from the reflected shader bindings.
    pub fn create_descriptor_set<'a>(
        &self,
        info: &DescriptorSetCreateInfo<'a>,
    ) -> Result<DescriptorSet> {
        DescriptorSet::new(self.clone(), info)
    }

    /// Create a fence.
    pub fn create_fence(&self, signaled: bool) -> Result<Fence> {
        Fence::new(self.clone(), signaled)
    }

    /// Create a GPU timestamp timer.
    pub fn create_timer(&self) -> Result<GpuTimer> {
        GpuTimer::new(self.clone())
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.inner.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            for thread_queue in self.threads.get_mut().values() {
                self.device
                    .destroy_command_pool(thread_queue.command_pool, None);
            }
            self.descriptor_pool.get_mut().destroy(&self.device);

            // Shutdown allocator BEFORE destroying device
            self.allocator.get_mut().shutdown();

            self.device.destroy_device(None);
            if let Some(messenger) = &self.debug_messenger {
                messenger.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    enable_ray_tracing: bool,
    max_queues: u32,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Reactive".to_string(),
            enable_validation: cfg!(debug_assertions),
            enable_ray_tracing: false,
            max_queues: 4,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Require acceleration structures and ray queries.
    pub fn ray_tracing(mut self, enable: bool) -> Self {
        self.enable_ray_tracing = enable;
        self
    }

    /// Upper bound on queues created from the general family.
    pub fn max_queues(mut self, count: u32) -> Self {
        self.max_queues = count.max(1);
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let debug_messenger = if self.enable_validation {
            Some(unsafe { DebugMessenger::new(&entry, &instance) }?)
        } else {
            None
        };

        let physical_device =
            unsafe { select_physical_device(&instance, self.enable_ray_tracing) }?;
        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let (queue_family, family_queue_count) =
            unsafe { find_general_queue_family(&instance, physical_device) }?;
        let queue_count = family_queue_count.min(self.max_queues);

        let device = unsafe {
            create_device(
                &instance,
                physical_device,
                queue_family,
                queue_count,
                self.enable_ray_tracing,
            )?
        };

        let queues = (0..queue_count)
            .map(|i| Mutex::new(unsafe { device.get_device_queue(queue_family, i) }))
            .collect::<Vec<_>>();

        tracing::info!(
            "Created device with {} queue(s) on family {}",
            queues.len(),
            queue_family
        );

        let allocator = unsafe {
            GpuAllocator::new(
                &instance,
                &device,
                physical_device,
                capabilities.supports_buffer_device_address,
            )
        }?;

        let accel_loader = self
            .enable_ray_tracing
            .then(|| ash::khr::acceleration_structure::Device::new(&instance, &device));
        let rt_pipeline_loader = self
            .enable_ray_tracing
            .then(|| ash::khr::ray_tracing_pipeline::Device::new(&instance, &device));

        let debug_utils = self
            .enable_validation
            .then(|| ash::ext::debug_utils::Device::new(&instance, &device));

        let descriptor_pool =
            unsafe { DescriptorPool::with_default_sizes(&device, self.enable_ray_tracing) }?;

        Ok(GpuContext {
            inner: Arc::new(ContextInner {
                entry,
                instance,
                debug_messenger,
                debug_utils,
                physical_device,
                device,
                capabilities,
                allocator: Mutex::new(allocator),
                accel_loader,
                rt_pipeline_loader,
                queue_family,
                threads: Mutex::new(ThreadSlots::new(queues.len())),
                queues,
                descriptor_pool: Mutex::new(descriptor_pool),
            }),
        })
    }
}

/// Find the first queue family supporting both graphics and compute.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_general_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<(u32, u32)> {
    let general = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;

    instance
        .get_physical_device_queue_family_properties(physical_device)
        .iter()
        .enumerate()
        .find(|(_, family)| family.queue_flags.contains(general))
        .map(|(i, family)| (i as u32, family.queue_count))
        .ok_or(GpuError::NoSuitableDevice)
}

/// Create the logical device.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    queue_count: u32,
    ray_tracing: bool,
) -> Result<ash::Device> {
    let priorities = vec![1.0_f32; queue_count as usize];
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&priorities);

    let extensions = required_device_extensions(ray_tracing);
    let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .maintenance4(true);

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .host_query_reset(true)
        .scalar_block_layout(true);

    let mut accel_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
    let mut ray_query_features = vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true);
    let mut pipeline_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

    let features = vk::PhysicalDeviceFeatures::default().shader_int64(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);

    if ray_tracing {
        features2 = features2
            .push_next(&mut accel_features)
            .push_next(&mut ray_query_features)
            .push_next(&mut pipeline_features);
    }

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance.create_device(physical_device, &device_create_info, None)?;

    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threads_are_assigned_round_robin() {
        let mut slots = ThreadSlots::<usize>::new(2);
        let ids: Vec<ThreadId> = (0..3)
            .map(|_| std::thread::spawn(|| std::thread::current().id()))
            .map(|handle| handle.join().unwrap())
            .collect();

        let assigned: Vec<usize> = ids
            .iter()
            .map(|id| slots.get_or_assign(*id, Ok).unwrap())
            .collect();
        assert_eq!(assigned, vec![0, 1, 0]);
    }

    #[test]
    fn thread_keeps_its_slot() {
        let mut slots = ThreadSlots::<usize>::new(4);
        let me = std::thread::current().id();

        let first = slots.get_or_assign(me, |i| Ok(i + 10)).unwrap();
        let second = slots
            .get_or_assign(me, |_| panic!("slot must be reused"))
            .unwrap();
        assert_eq!(first, 10);
        assert_eq!(second, 10);
        assert_eq!(slots.values().count(), 1);
    }

    #[test]
    fn failed_assignment_does_not_consume_a_queue() {
        let mut slots = ThreadSlots::<usize>::new(3);
        let me = std::thread::current().id();

        assert!(slots
            .get_or_assign(me, |_| Err(GpuError::Other("pool".to_string())))
            .is_err());
        assert_eq!(slots.get_or_assign(me, Ok).unwrap(), 0);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn one_time_submit_runs_on_calling_thread_queue() {
        let ctx = GpuContextBuilder::new().validation(false).build().unwrap();
        ctx.one_time_submit(|_| Ok(())).unwrap();
        assert!(ctx.queue_count() >= 1);
    }
}
