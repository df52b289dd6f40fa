//! crates/doc_chat_core/src/navigation.rs
//!
//! Routes a selected citation to the viewer. Holds no state of its own, so neither the
//! conversation nor the viewer needs to know the other exists.

use crate::domain::Citation;
use crate::viewer::{RenderRequest, ViewerState};
use tracing::debug;

pub struct NavigationBridge;

impl NavigationBridge {
    /// Sends the viewer to the cited page. Never fails: out-of-range pages are clamped
    /// by the viewer.
    pub fn activate(citation: &Citation, viewer: &mut ViewerState) -> Option<RenderRequest> {
        debug!("Citation '{}' activated.", citation.label);
        Self::activate_page(citation.target_page, viewer)
    }

    /// Same as `activate` for callers that only carry the page number.
    pub fn activate_page(page: u32, viewer: &mut ViewerState) -> Option<RenderRequest> {
        viewer.go_to(i64::from(page))
    }
}
