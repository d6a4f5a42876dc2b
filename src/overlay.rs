//! Overlay draw-batch ingestion.
//!
//! The immediate-mode UI lives outside this renderer; each frame it hands
//! over a list of draw batches, each a vertex blob, an index blob, and a
//! run of clipped indexed draws. The core's only jobs are to place those
//! bytes into the current frame slot's overlay streams under the fixed
//! per-frame budget and to emit the corresponding draw calls. Overrunning
//! the budget is an error, never a truncation; the collaborator is expected
//! to bound its per-frame geometry volume.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::arena::align_up;
use crate::error::{Error, Result};
use crate::frame::{FrameSlot, OVERLAY_INDEX_BUDGET, OVERLAY_VERTEX_BUDGET};

/// Overlay vertex layout: screen position, UV, packed color. 20 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct OverlayVertex {
    pub pos: [f32; 2],
    pub uv: [f32; 2],
    pub color: [u8; 4],
}

pub const OVERLAY_VERTEX_STRIDE: u64 = std::mem::size_of::<OverlayVertex>() as u64;
pub const OVERLAY_INDEX_STRIDE: u64 = std::mem::size_of::<u16>() as u64;

/// One clipped draw inside a batch, consuming `index_count` consecutive
/// indices. `clip_rect` is (x1, y1, x2, y2) in framebuffer pixels.
#[derive(Debug, Clone, Copy)]
pub struct OverlayDraw {
    pub clip_rect: [f32; 4],
    pub index_count: u32,
}

/// One batch from the overlay collaborator: raw vertex and index blobs plus
/// the draws that consume them.
#[derive(Debug, Default)]
pub struct OverlayBatch {
    pub vertices: Vec<u8>,
    pub indices: Vec<u8>,
    pub draws: Vec<OverlayDraw>,
}

#[derive(Debug, Default)]
pub struct OverlayFrame {
    pub batches: Vec<OverlayBatch>,
}

/// A draw call ready to record: scissor plus index/vertex stream positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayDrawCall {
    pub scissor: vk::Rect2D,
    pub index_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
}

/// Place each batch's blobs at stride-aligned cursors inside the overlay
/// streams. Returns per-batch (vertex, index) byte offsets.
pub fn place_batches(
    batch_sizes: &[(u64, u64)],
    vertex_budget: u64,
    index_budget: u64,
) -> Result<Vec<(u64, u64)>> {
    let mut placements = Vec::with_capacity(batch_sizes.len());
    let mut vertex_cursor = 0u64;
    let mut index_cursor = 0u64;

    for &(vertex_len, index_len) in batch_sizes {
        if vertex_cursor + vertex_len > vertex_budget {
            return Err(Error::ArenaExhausted {
                name: "overlay vertices",
                size: vertex_len,
                alignment: OVERLAY_VERTEX_STRIDE,
                remaining: vertex_budget - vertex_cursor,
                capacity: vertex_budget,
            });
        }
        if index_cursor + index_len > index_budget {
            return Err(Error::ArenaExhausted {
                name: "overlay indices",
                size: index_len,
                alignment: OVERLAY_INDEX_STRIDE,
                remaining: index_budget - index_cursor,
                capacity: index_budget,
            });
        }
        placements.push((vertex_cursor, index_cursor));
        // Keep every batch start a whole number of elements into the stream
        // so vertex_offset/first_index stay integral.
        vertex_cursor += align_up(vertex_len, OVERLAY_VERTEX_STRIDE);
        index_cursor += align_up(index_len, OVERLAY_INDEX_STRIDE);
    }

    Ok(placements)
}

/// Clamp a clip rect to the framebuffer; `None` when it lies fully outside.
pub fn clip_to_scissor(clip: [f32; 4], width: u32, height: u32) -> Option<vk::Rect2D> {
    let [x1, y1, x2, y2] = clip;
    if x1 >= width as f32 || y1 >= height as f32 || x2 < 0.0 || y2 < 0.0 {
        return None;
    }
    let x1 = x1.max(0.0);
    let y1 = y1.max(0.0);
    Some(vk::Rect2D {
        offset: vk::Offset2D {
            x: x1 as i32,
            y: y1 as i32,
        },
        extent: vk::Extent2D {
            width: (x2 - x1).max(0.0) as u32,
            height: (y2 - y1).max(0.0) as u32,
        },
    })
}

/// Copy the frame's batches into the slot's mapped overlay streams and
/// produce the draw calls. Must run after the slot's fence wait.
pub fn write_frame(
    slot: &mut FrameSlot,
    frame: &OverlayFrame,
    width: u32,
    height: u32,
) -> Result<Vec<OverlayDrawCall>> {
    let batch_sizes: Vec<(u64, u64)> = frame
        .batches
        .iter()
        .map(|b| (b.vertices.len() as u64, b.indices.len() as u64))
        .collect();
    let placements = place_batches(&batch_sizes, OVERLAY_VERTEX_BUDGET, OVERLAY_INDEX_BUDGET)?;

    let vertex_base = slot.overlay_vertices.offset;
    let index_base = slot.overlay_indices.offset;

    let mut draw_calls = Vec::new();
    for (batch, &(vertex_offset, index_offset)) in frame.batches.iter().zip(&placements) {
        if !batch.vertices.is_empty() {
            slot.arena
                .mapped_slice_mut(vertex_base + vertex_offset, batch.vertices.len() as u64)
                .copy_from_slice(&batch.vertices);
        }
        if !batch.indices.is_empty() {
            slot.arena
                .mapped_slice_mut(index_base + index_offset, batch.indices.len() as u64)
                .copy_from_slice(&batch.indices);
        }

        let mut first_index = (index_offset / OVERLAY_INDEX_STRIDE) as u32;
        let vertex_element = (vertex_offset / OVERLAY_VERTEX_STRIDE) as i32;
        for draw in &batch.draws {
            if let Some(scissor) = clip_to_scissor(draw.clip_rect, width, height) {
                draw_calls.push(OverlayDrawCall {
                    scissor,
                    index_count: draw.index_count,
                    first_index,
                    vertex_offset: vertex_element,
                });
            }
            first_index += draw.index_count;
        }
    }

    Ok(draw_calls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placements_advance_by_whole_elements() {
        // 3 vertices (60 bytes) and 7 indices (14 bytes) in the first
        // batch; the second batch must start on element boundaries.
        let placements = place_batches(&[(60, 14), (40, 6)], 1 << 20, 1 << 20).unwrap();
        assert_eq!(placements[0], (0, 0));
        assert_eq!(placements[1].0 % OVERLAY_VERTEX_STRIDE, 0);
        assert_eq!(placements[1].1 % OVERLAY_INDEX_STRIDE, 0);
        assert_eq!(placements[1], (60, 14));
    }

    #[test]
    fn vertex_budget_overflow_is_an_error() {
        let err = place_batches(&[(100, 10)], 99, 1 << 20).unwrap_err();
        assert!(matches!(
            err,
            Error::ArenaExhausted {
                name: "overlay vertices",
                ..
            }
        ));

        let err = place_batches(&[(10, 100)], 1 << 20, 99).unwrap_err();
        assert!(matches!(
            err,
            Error::ArenaExhausted {
                name: "overlay indices",
                ..
            }
        ));
    }

    #[test]
    fn budget_exact_fit_is_accepted() {
        let placements = place_batches(&[(100, 40)], 100, 40).unwrap();
        assert_eq!(placements, vec![(0, 0)]);
    }

    #[test]
    fn scissor_clamps_negative_corners() {
        let scissor = clip_to_scissor([-5.0, -3.0, 10.0, 8.0], 100, 100).unwrap();
        assert_eq!(scissor.offset, vk::Offset2D { x: 0, y: 0 });
        assert_eq!(
            scissor.extent,
            vk::Extent2D {
                width: 15,
                height: 11
            }
        );
    }

    #[test]
    fn fully_offscreen_rects_are_rejected() {
        assert!(clip_to_scissor([120.0, 0.0, 150.0, 10.0], 100, 100).is_none());
        assert!(clip_to_scissor([0.0, -20.0, 10.0, -5.0], 100, 100).is_none());
    }

    #[test]
    fn overlay_vertex_is_20_bytes() {
        assert_eq!(OVERLAY_VERTEX_STRIDE, 20);
    }
}
