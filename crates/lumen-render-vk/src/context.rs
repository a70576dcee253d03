// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface, physical/logical device and queues.
//!
//! A [`DeviceContext`] is created once, shared as `Arc<DeviceContext>` by every
//! object that owns a Vulkan handle, and therefore dropped after all of them.

use std::ffi::{c_char, c_void, CStr};
use std::sync::Arc;

use ash::ext::{debug_utils, headless_surface};
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use lumen_render::WindowHost;
use tracing::{debug, error, info, warn};

use crate::error::{VkContext, VkError, VkResult};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Picks queue families for graphics and presentation.
///
/// A family doing both is preferred; otherwise the first graphics family is
/// paired with the first presenting family.
pub(crate) fn find_queue_families(
    families: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> Option<QueueFamilyIndices> {
    let mut graphics = None;
    let mut present = None;

    for (i, family) in families.iter().enumerate() {
        let i = i as u32;
        let is_graphics =
            family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let presents = supports_present(i);

        if is_graphics && presents {
            return Some(QueueFamilyIndices {
                graphics: i,
                present: i,
            });
        }
        if is_graphics && graphics.is_none() {
            graphics = Some(i);
        }
        if presents && present.is_none() {
            present = Some(i);
        }
    }

    Some(QueueFamilyIndices {
        graphics: graphics?,
        present: present?,
    })
}

/// What was learned about one enumerated GPU.
#[derive(Clone, Debug)]
pub(crate) struct DeviceCandidate {
    pub name: String,
    pub families: Option<QueueFamilyIndices>,
    pub has_extensions: bool,
    pub anisotropy: bool,
    pub surface_formats: usize,
    pub present_modes: usize,
}

impl DeviceCandidate {
    /// `None` when eligible, otherwise the first failed requirement.
    pub fn rejection(&self, needs_surface: bool) -> Option<&'static str> {
        if self.families.is_none() {
            return Some("no graphics/present queue family");
        }
        if !needs_surface {
            return None;
        }
        if !self.has_extensions {
            return Some("missing VK_KHR_swapchain");
        }
        if !self.anisotropy {
            return Some("no sampler anisotropy");
        }
        if self.surface_formats == 0 {
            return Some("no surface format");
        }
        if self.present_modes == 0 {
            return Some("no present mode");
        }
        None
    }
}

/// First eligible candidate wins; there is no ranking.
pub(crate) fn select_first_eligible(
    candidates: &[DeviceCandidate],
    needs_surface: bool,
) -> Result<usize, VkError> {
    if let Some(i) = candidates
        .iter()
        .position(|c| c.rejection(needs_surface).is_none())
    {
        return Ok(i);
    }

    let reason = if candidates.is_empty() {
        "no GPU with Vulkan support".to_owned()
    } else {
        candidates
            .iter()
            .map(|c| format!("{}: {}", c.name, c.rejection(needs_surface).unwrap_or("ok")))
            .collect::<Vec<_>>()
            .join("; ")
    };
    Err(VkError::NoSuitableDevice { reason })
}

struct SurfaceBinding {
    loader: surface::Instance,
    surface: vk::SurfaceKHR,
}

struct DebugMessenger {
    loader: debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

pub struct DeviceContext {
    _entry: Entry,
    instance: Instance,
    debug: Option<DebugMessenger>,
    surface: Option<SurfaceBinding>,

    physical: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device: ash::Device,
    swapchain_loader: Option<swapchain::Device>,

    families: QueueFamilyIndices,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    anisotropy: bool,
}

impl DeviceContext {
    /// Full context bound to the window's surface.
    pub fn new(host: &dyn WindowHost, validation: bool) -> VkResult<Arc<Self>> {
        let display = host.display_handle()?.as_raw();
        let window = host.window_handle()?.as_raw();

        let entry = unsafe { Entry::load()? };
        let extensions = ash_window::enumerate_required_extensions(display)
            .vk("enumerate_required_extensions")?
            .to_vec();
        let (instance, debug) = create_instance(&entry, extensions, validation)?;

        let created =
            unsafe { ash_window::create_surface(&entry, &instance, display, window, None) };
        Self::with_surface(entry, instance, debug, created, "vkCreateSurfaceKHR")
    }

    /// Context bound to a `VK_EXT_headless_surface` surface: real swapchains
    /// whose images are never shown. Fails with `MissingExtension` when the
    /// loader does not offer the extension.
    pub fn offscreen(validation: bool) -> VkResult<Arc<Self>> {
        let entry = unsafe { Entry::load()? };
        let available = unsafe { entry.enumerate_instance_extension_properties(None) }
            .vk("vkEnumerateInstanceExtensionProperties")?;
        if !available
            .iter()
            .any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == headless_surface::NAME))
        {
            return Err(VkError::MissingExtension(
                headless_surface::NAME.to_string_lossy().into_owned(),
            ));
        }

        let extensions = vec![surface::NAME.as_ptr(), headless_surface::NAME.as_ptr()];
        let (instance, debug) = create_instance(&entry, extensions, validation)?;

        let loader = headless_surface::Instance::new(&entry, &instance);
        let info = vk::HeadlessSurfaceCreateInfoEXT::default();
        let created = unsafe { loader.create_headless_surface(&info, None) };
        Self::with_surface(entry, instance, debug, created, "vkCreateHeadlessSurfaceEXT")
    }

    /// Context without a presentation surface, for uploads and readbacks only.
    pub fn headless(validation: bool) -> VkResult<Arc<Self>> {
        let entry = unsafe { Entry::load()? };
        let (instance, debug) = create_instance(&entry, Vec::new(), validation)?;
        Self::finish(entry, instance, debug, None)
    }

    fn with_surface(
        entry: Entry,
        instance: Instance,
        debug: Option<DebugMessenger>,
        created: Result<vk::SurfaceKHR, vk::Result>,
        what: &'static str,
    ) -> VkResult<Arc<Self>> {
        let surface = match created {
            Ok(s) => s,
            Err(result) => {
                unsafe { destroy_instance_objects(&instance, debug.as_ref(), None) };
                return Err(VkError::Vulkan { what, result });
            }
        };
        let binding = SurfaceBinding {
            loader: surface::Instance::new(&entry, &instance),
            surface,
        };
        Self::finish(entry, instance, debug, Some(binding))
    }

    fn finish(
        entry: Entry,
        instance: Instance,
        debug: Option<DebugMessenger>,
        surface: Option<SurfaceBinding>,
    ) -> VkResult<Arc<Self>> {
        // Partially built state is unwound by hand until the context owns it.
        let picked = match pick_physical_device(&instance, surface.as_ref()) {
            Ok(p) => p,
            Err(e) => {
                unsafe { destroy_instance_objects(&instance, debug.as_ref(), surface.as_ref()) };
                return Err(e);
            }
        };
        let (physical, families, anisotropy) = picked;

        let device = match create_logical_device(
            &instance,
            physical,
            families,
            anisotropy,
            surface.is_some(),
        ) {
            Ok(d) => d,
            Err(e) => {
                unsafe { destroy_instance_objects(&instance, debug.as_ref(), surface.as_ref()) };
                return Err(e);
            }
        };

        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };
        let properties = unsafe { instance.get_physical_device_properties(physical) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical) };
        let swapchain_loader = surface
            .as_ref()
            .map(|_| swapchain::Device::new(&instance, &device));

        info!(
            "vk: device '{}' (graphics family {}, present family {}, anisotropy={})",
            device_name(&properties),
            families.graphics,
            families.present,
            anisotropy
        );

        Ok(Arc::new(Self {
            _entry: entry,
            instance,
            debug,
            surface,
            physical,
            properties,
            memory_properties,
            device,
            swapchain_loader,
            families,
            graphics_queue,
            present_queue,
            anisotropy,
        }))
    }

    #[inline]
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn physical(&self) -> vk::PhysicalDevice {
        self.physical
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn families(&self) -> QueueFamilyIndices {
        self.families
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn anisotropy_enabled(&self) -> bool {
        self.anisotropy
    }

    pub fn surface(&self) -> VkResult<(&surface::Instance, vk::SurfaceKHR)> {
        self.surface
            .as_ref()
            .map(|s| (&s.loader, s.surface))
            .ok_or(VkError::SwapchainUnavailable)
    }

    pub fn swapchain_loader(&self) -> VkResult<&swapchain::Device> {
        self.swapchain_loader
            .as_ref()
            .ok_or(VkError::SwapchainUnavailable)
    }

    pub fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }.vk("vkDeviceWaitIdle")
    }
}

// STRICT TEARDOWN ORDER: device, surface, debug messenger, instance.
impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
            destroy_instance_objects(&self.instance, self.debug.as_ref(), self.surface.as_ref());
        }
        info!("vk: device context destroyed");
    }
}

unsafe fn destroy_instance_objects(
    instance: &Instance,
    debug: Option<&DebugMessenger>,
    surface: Option<&SurfaceBinding>,
) {
    unsafe {
        if let Some(s) = surface {
            s.loader.destroy_surface(s.surface, None);
        }
        if let Some(d) = debug {
            d.loader.destroy_debug_utils_messenger(d.messenger, None);
        }
        instance.destroy_instance(None);
    }
}

fn device_name(props: &vk::PhysicalDeviceProperties) -> String {
    props
        .device_name_as_c_str()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "<unnamed>".to_owned())
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    let msg = unsafe {
        let p = (*data).p_message;
        if p.is_null() {
            return vk::FALSE;
        }
        CStr::from_ptr(p).to_string_lossy()
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[validation] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[validation] {msg}");
    } else {
        debug!("[validation] {msg}");
    }
    vk::FALSE
}

fn validation_available(entry: &Entry) -> bool {
    unsafe { entry.enumerate_instance_layer_properties() }
        .unwrap_or_default()
        .iter()
        .any(|l| l.layer_name_as_c_str().is_ok_and(|n| n == VALIDATION_LAYER))
}

fn create_instance(
    entry: &Entry,
    mut extensions: Vec<*const c_char>,
    validation: bool,
) -> VkResult<(Instance, Option<DebugMessenger>)> {
    let app_info = vk::ApplicationInfo::default()
        .application_name(c"lumen")
        .engine_name(c"lumen")
        .api_version(vk::API_VERSION_1_0);

    let validation = validation && validation_available(entry);
    if validation {
        extensions.push(debug_utils::NAME.as_ptr());
    } else {
        debug!("vk: validation layers disabled");
    }
    let layers = [VALIDATION_LAYER.as_ptr()];
    let enabled_layers: &[*const c_char] = if validation { &layers } else { &[] };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(enabled_layers);

    let instance = unsafe { entry.create_instance(&create_info, None) }.vk("vkCreateInstance")?;

    if !validation {
        return Ok((instance, None));
    }

    let loader = debug_utils::Instance::new(entry, &instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    match unsafe { loader.create_debug_utils_messenger(&ci, None) } {
        Ok(messenger) => {
            info!("vk: validation layers enabled");
            Ok((instance, Some(DebugMessenger { loader, messenger })))
        }
        Err(e) => {
            warn!("vk: debug messenger unavailable ({e}); continuing without it");
            Ok((instance, None))
        }
    }
}

fn has_swapchain_extension(instance: &Instance, physical: vk::PhysicalDevice) -> bool {
    unsafe { instance.enumerate_device_extension_properties(physical) }
        .unwrap_or_default()
        .iter()
        .any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == swapchain::NAME))
}

fn describe_candidate(
    instance: &Instance,
    physical: vk::PhysicalDevice,
    surface: Option<&SurfaceBinding>,
) -> DeviceCandidate {
    let props = unsafe { instance.get_physical_device_properties(physical) };
    let features = unsafe { instance.get_physical_device_features(physical) };
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical) };

    let families = match surface {
        Some(s) => find_queue_families(&queue_families, |i| unsafe {
            s.loader
                .get_physical_device_surface_support(physical, i, s.surface)
                .unwrap_or(false)
        }),
        None => find_queue_families(&queue_families, |_| true),
    };

    let (surface_formats, present_modes) = match surface {
        Some(s) => unsafe {
            (
                s.loader
                    .get_physical_device_surface_formats(physical, s.surface)
                    .map(|v| v.len())
                    .unwrap_or(0),
                s.loader
                    .get_physical_device_surface_present_modes(physical, s.surface)
                    .map(|v| v.len())
                    .unwrap_or(0),
            )
        },
        None => (0, 0),
    };

    DeviceCandidate {
        name: device_name(&props),
        families,
        has_extensions: has_swapchain_extension(instance, physical),
        anisotropy: features.sampler_anisotropy == vk::TRUE,
        surface_formats,
        present_modes,
    }
}

fn pick_physical_device(
    instance: &Instance,
    surface: Option<&SurfaceBinding>,
) -> VkResult<(vk::PhysicalDevice, QueueFamilyIndices, bool)> {
    let physicals =
        unsafe { instance.enumerate_physical_devices() }.vk("vkEnumeratePhysicalDevices")?;
    let candidates: Vec<_> = physicals
        .iter()
        .map(|&p| describe_candidate(instance, p, surface))
        .collect();

    for c in &candidates {
        match c.rejection(surface.is_some()) {
            None => debug!("vk: candidate '{}' eligible", c.name),
            Some(why) => debug!("vk: candidate '{}' rejected: {why}", c.name),
        }
    }

    let idx = select_first_eligible(&candidates, surface.is_some())?;
    let chosen = &candidates[idx];
    let families = chosen
        .families
        .ok_or_else(|| VkError::NoSuitableDevice {
            reason: "queue families vanished".to_owned(),
        })?;
    Ok((physicals[idx], families, chosen.anisotropy))
}

fn create_logical_device(
    instance: &Instance,
    physical: vk::PhysicalDevice,
    families: QueueFamilyIndices,
    anisotropy: bool,
    with_swapchain: bool,
) -> VkResult<ash::Device> {
    let priorities = [1.0_f32];
    let queue_infos: Vec<_> = families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&priorities)
        })
        .collect();

    let features = vk::PhysicalDeviceFeatures {
        sampler_anisotropy: if anisotropy { vk::TRUE } else { vk::FALSE },
        ..Default::default()
    };

    let mut device_exts: Vec<*const c_char> = Vec::new();
    if with_swapchain {
        if !has_swapchain_extension(instance, physical) {
            return Err(VkError::MissingExtension(
                swapchain::NAME.to_string_lossy().into_owned(),
            ));
        }
        device_exts.push(swapchain::NAME.as_ptr());
    }

    let dinfo = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_features(&features)
        .enabled_extension_names(&device_exts);

    unsafe { instance.create_device(physical, &dinfo, None) }.vk("vkCreateDevice")
}
