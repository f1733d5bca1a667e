//! Render passes and framebuffers.

use ash::vk;
use nadir_rhi_derive::DeviceObject;

use crate::backend::{RenderPassDesc, SubpassDesc};
use crate::device::DeviceRef;
use crate::error::{RhiError, RhiResult};
use crate::render_target::RenderTarget;
use crate::utility::is_depth_format;

/// Description of one render target attachment as seen by a render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Attachment {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    /// Last known layout of the image; `UNDEFINED` lets the render pass pick one.
    pub initial_layout: vk::ImageLayout,
}

impl Default for Attachment {
    fn default() -> Self {
        Self {
            format: vk::Format::UNDEFINED,
            samples: vk::SampleCountFlags::TYPE_1,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            initial_layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

impl Attachment {
    pub fn new(format: vk::Format, samples: vk::SampleCountFlags, usage: vk::ImageUsageFlags) -> Self {
        Self { format, samples, usage, initial_layout: vk::ImageLayout::UNDEFINED }
    }
}

/// Load and store operations for one attachment; stencil ops mirror these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadStoreInfo {
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
}

impl Default for LoadStoreInfo {
    fn default() -> Self {
        Self {
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
        }
    }
}

/// Attachment indices used by one subpass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SubpassInfo {
    pub input_attachments: Vec<u32>,
    pub output_attachments: Vec<u32>,
    pub color_resolve_attachments: Vec<u32>,
    pub disable_depth_stencil_attachment: bool,
}

impl SubpassInfo {
    /// Subpass reading and writing the attachments a render target currently advertises.
    pub fn from_render_target(render_target: &RenderTarget) -> Self {
        Self {
            input_attachments: render_target.input_attachments().to_vec(),
            output_attachments: render_target.output_attachments().to_vec(),
            ..Default::default()
        }
    }
}

fn reference(attachment: u32, layout: vk::ImageLayout) -> vk::AttachmentReference {
    vk::AttachmentReference { attachment, layout }
}

fn layout_or(attachment: &Attachment, fallback: vk::ImageLayout) -> vk::ImageLayout {
    if attachment.initial_layout == vk::ImageLayout::UNDEFINED {
        fallback
    } else {
        attachment.initial_layout
    }
}

fn lookup(attachments: &[Attachment], index: u32) -> RhiResult<&Attachment> {
    attachments.get(index as usize).ok_or_else(|| {
        RhiError::InvalidRenderTarget(format!(
            "subpass references attachment {index} but only {} exist",
            attachments.len()
        ))
    })
}

/// Resolve attachments, load/store ops and subpass infos into a full render pass description.
///
/// Returns the description and the number of color outputs of each subpass.
pub fn describe_render_pass(
    attachments: &[Attachment],
    load_store_infos: &[LoadStoreInfo],
    subpasses: &[SubpassInfo],
) -> RhiResult<(RenderPassDesc, Vec<u32>)> {
    let mut descriptions: Vec<vk::AttachmentDescription> = attachments
        .iter()
        .enumerate()
        .map(|(i, attachment)| {
            let ops = load_store_infos.get(i);
            let load_op = ops.map_or(vk::AttachmentLoadOp::default(), |o| o.load_op);
            let store_op = ops.map_or(vk::AttachmentStoreOp::default(), |o| o.store_op);
            vk::AttachmentDescription {
                format: attachment.format,
                samples: attachment.samples,
                load_op,
                store_op,
                stencil_load_op: load_op,
                stencil_store_op: store_op,
                initial_layout: attachment.initial_layout,
                final_layout: if is_depth_format(attachment.format) {
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                } else {
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
                },
                ..Default::default()
            }
        })
        .collect();

    let depth_attachment = attachments
        .iter()
        .position(|a| is_depth_format(a.format))
        .map(|i| i as u32);

    let mut subpass_descs = Vec::with_capacity(subpasses.len().max(1));
    for subpass in subpasses {
        let mut desc = SubpassDesc::default();

        for &o in &subpass.output_attachments {
            let attachment = lookup(attachments, o)?;
            if !is_depth_format(attachment.format) {
                desc.color_attachments
                    .push(reference(o, layout_or(attachment, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)));
            }
        }

        for &i in &subpass.input_attachments {
            let layout = if is_depth_format(lookup(attachments, i)?.format) {
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            } else {
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            };
            desc.input_attachments.push(reference(i, layout));
        }

        for &r in &subpass.color_resolve_attachments {
            let attachment = lookup(attachments, r)?;
            desc.resolve_attachments
                .push(reference(r, layout_or(attachment, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)));
        }

        if !subpass.disable_depth_stencil_attachment {
            if let Some(d) = depth_attachment {
                let layout = layout_or(&attachments[d as usize], vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
                desc.depth_stencil_attachment = Some(reference(d, layout));
            }
        }

        subpass_descs.push(desc);
    }

    if subpasses.is_empty() {
        let mut desc = SubpassDesc::default();
        for (k, attachment) in attachments.iter().enumerate() {
            if !is_depth_format(attachment.format) {
                desc.color_attachments.push(reference(k as u32, vk::ImageLayout::GENERAL));
            }
        }
        desc.depth_stencil_attachment =
            depth_attachment.map(|d| reference(d, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL));
        subpass_descs.push(desc);
    }

    let color_output_count = subpass_descs.iter().map(|s| s.color_attachments.len() as u32).collect();

    set_attachment_layouts(&mut subpass_descs, &mut descriptions);

    let dependencies = subpass_dependencies(
        subpass_descs.len(),
        is_depth_a_dependency(&subpass_descs, &descriptions),
    );

    Ok((
        RenderPassDesc {
            attachments: descriptions,
            subpasses: subpass_descs,
            dependencies,
        },
        color_output_count,
    ))
}

/// Undefined initial layouts take their first use; final layouts take the last subpass's use.
fn set_attachment_layouts(subpasses: &mut [SubpassDesc], descriptions: &mut [vk::AttachmentDescription]) {
    for subpass in subpasses.iter() {
        let references = subpass
            .color_attachments
            .iter()
            .chain(&subpass.input_attachments)
            .chain(&subpass.depth_stencil_attachment)
            .chain(&subpass.resolve_attachments);
        for r in references {
            let description = &mut descriptions[r.attachment as usize];
            if description.initial_layout == vk::ImageLayout::UNDEFINED {
                description.initial_layout = r.layout;
            }
        }
    }

    let Some(last) = subpasses.last_mut() else {
        return;
    };

    for r in &last.color_attachments {
        descriptions[r.attachment as usize].final_layout = r.layout;
    }

    for r in &last.input_attachments {
        descriptions[r.attachment as usize].final_layout = r.layout;
        // A depth attachment read as input cannot also be the depth target.
        if is_depth_format(descriptions[r.attachment as usize].format) {
            last.depth_stencil_attachment = None;
        }
    }

    if let Some(r) = &last.depth_stencil_attachment {
        descriptions[r.attachment as usize].final_layout = r.layout;
    }

    for r in &last.resolve_attachments {
        descriptions[r.attachment as usize].final_layout = r.layout;
    }
}

/// Assumes a single depth attachment.
fn is_depth_a_dependency(subpasses: &[SubpassDesc], descriptions: &[vk::AttachmentDescription]) -> bool {
    if subpasses.iter().filter(|s| s.depth_stencil_attachment.is_some()).count() > 1 {
        return true;
    }

    subpasses.iter().any(|s| {
        s.input_attachments
            .iter()
            .any(|r| is_depth_format(descriptions[r.attachment as usize].format))
    })
}

fn subpass_dependencies(subpass_count: usize, depth_stencil_dependency: bool) -> Vec<vk::SubpassDependency> {
    let mut dependencies = Vec::new();

    for subpass in 0..subpass_count.saturating_sub(1) as u32 {
        dependencies.push(vk::SubpassDependency {
            src_subpass: subpass,
            dst_subpass: subpass + 1,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::FRAGMENT_SHADER,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::INPUT_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        });

        if depth_stencil_dependency {
            dependencies.push(vk::SubpassDependency {
                src_subpass: subpass,
                dst_subpass: subpass + 1,
                src_stage_mask: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                dst_stage_mask: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::FRAGMENT_SHADER,
                src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dst_access_mask: vk::AccessFlags::INPUT_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dependency_flags: vk::DependencyFlags::BY_REGION,
            });
        }
    }

    dependencies
}

#[DeviceObject]
pub struct RenderPass {
    handle: vk::RenderPass,
    color_output_count: Vec<u32>,
}

impl RenderPass {
    pub fn new(
        device: &DeviceRef,
        attachments: &[Attachment],
        load_store_infos: &[LoadStoreInfo],
        subpasses: &[SubpassInfo],
    ) -> RhiResult<Self> {
        let (desc, color_output_count) = describe_render_pass(attachments, load_store_infos, subpasses)?;
        let handle = device.create_render_pass(&desc)?;
        Ok(Self {
            handle,
            color_output_count,
            device: device.clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::RenderPass { self.handle }

    /// At least one; a pass built without subpass infos gets a default subpass.
    #[inline]
    pub fn subpass_count(&self) -> usize { self.color_output_count.len() }

    pub fn color_output_count(&self, subpass_index: u32) -> u32 {
        self.color_output_count.get(subpass_index as usize).copied().unwrap_or(0)
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.device.destroy_render_pass(self.handle);
    }
}

/// The views of one render target bound to a render pass's attachment slots.
#[DeviceObject]
pub struct Framebuffer {
    handle: vk::Framebuffer,
    extent: vk::Extent2D,
}

impl Framebuffer {
    pub fn new(device: &DeviceRef, render_target: &RenderTarget, render_pass: &RenderPass) -> RhiResult<Self> {
        let views: Vec<vk::ImageView> = render_target.views().iter().map(|v| v.handle()).collect();
        let extent = render_target.extent();
        let handle = device.create_framebuffer(render_pass.handle(), &views, extent)?;
        Ok(Self {
            handle,
            extent,
            device: device.clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Framebuffer { self.handle }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D { self.extent }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.device.destroy_framebuffer(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color() -> Attachment {
        Attachment::new(vk::Format::B8G8R8A8_SRGB, vk::SampleCountFlags::TYPE_1, vk::ImageUsageFlags::COLOR_ATTACHMENT)
    }

    fn depth() -> Attachment {
        Attachment::new(
            vk::Format::D32_SFLOAT,
            vk::SampleCountFlags::TYPE_1,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )
    }

    fn subpass(inputs: &[u32], outputs: &[u32]) -> SubpassInfo {
        SubpassInfo {
            input_attachments: inputs.to_vec(),
            output_attachments: outputs.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn single_subpass_writes_color_and_depth() {
        let (desc, counts) = describe_render_pass(
            &[color(), depth()],
            &[LoadStoreInfo::default(), LoadStoreInfo { load_op: vk::AttachmentLoadOp::CLEAR, store_op: vk::AttachmentStoreOp::DONT_CARE }],
            &[subpass(&[], &[0])],
        )
        .unwrap();

        assert_eq!(counts, vec![1]);
        assert_eq!(desc.subpasses.len(), 1);
        let sub = &desc.subpasses[0];
        assert_eq!(sub.color_attachments.len(), 1);
        assert_eq!(sub.color_attachments[0].layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(sub.depth_stencil_attachment.map(|r| r.attachment), Some(1));

        assert_eq!(desc.attachments[0].initial_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(desc.attachments[1].initial_layout, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        assert_eq!(desc.attachments[1].store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(desc.attachments[1].stencil_store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert!(desc.dependencies.is_empty());
    }

    #[test]
    fn empty_subpass_list_gets_default_subpass() {
        let (desc, counts) = describe_render_pass(&[color(), depth(), color()], &[], &[]).unwrap();

        assert_eq!(counts, vec![2]);
        let sub = &desc.subpasses[0];
        assert!(sub.color_attachments.iter().all(|r| r.layout == vk::ImageLayout::GENERAL));
        assert_eq!(sub.color_attachments.iter().map(|r| r.attachment).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(sub.depth_stencil_attachment.map(|r| r.attachment), Some(1));
        assert_eq!(desc.attachments[0].final_layout, vk::ImageLayout::GENERAL);
    }

    #[test]
    fn depth_read_as_input_in_last_subpass_drops_depth_target() {
        let (desc, counts) = describe_render_pass(
            &[color(), depth(), color()],
            &[],
            &[subpass(&[], &[2]), subpass(&[1, 2], &[0])],
        )
        .unwrap();

        assert_eq!(counts, vec![1, 1]);
        assert!(desc.subpasses[0].depth_stencil_attachment.is_some());
        assert!(desc.subpasses[1].depth_stencil_attachment.is_none());
        assert_eq!(desc.attachments[1].final_layout, vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL);
        assert_eq!(desc.attachments[2].final_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(desc.attachments[0].final_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        // color + depth dependency between the two subpasses
        assert_eq!(desc.dependencies.len(), 2);
        assert!(desc
            .dependencies
            .iter()
            .all(|d| d.dependency_flags == vk::DependencyFlags::BY_REGION && d.src_subpass == 0 && d.dst_subpass == 1));
    }

    #[test]
    fn color_only_chain_has_color_dependencies() {
        let (desc, _) = describe_render_pass(
            &[color(), color()],
            &[],
            &[subpass(&[], &[1]), subpass(&[1], &[0]), subpass(&[], &[0])],
        )
        .unwrap();
        assert_eq!(desc.dependencies.len(), 2);
        assert_eq!(desc.dependencies[1].src_subpass, 1);
    }

    #[test]
    fn known_initial_layout_is_kept() {
        let mut target = color();
        target.initial_layout = vk::ImageLayout::PRESENT_SRC_KHR;
        let (desc, _) = describe_render_pass(&[target], &[], &[subpass(&[], &[0])]).unwrap();
        assert_eq!(desc.attachments[0].initial_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(desc.subpasses[0].color_attachments[0].layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn disabled_depth_and_out_of_range_indices() {
        let mut info = subpass(&[], &[0]);
        info.disable_depth_stencil_attachment = true;
        let (desc, _) = describe_render_pass(&[color(), depth()], &[], &[info]).unwrap();
        assert!(desc.subpasses[0].depth_stencil_attachment.is_none());

        assert!(matches!(
            describe_render_pass(&[color()], &[], &[subpass(&[], &[3])]),
            Err(RhiError::InvalidRenderTarget(_))
        ));
    }
}
