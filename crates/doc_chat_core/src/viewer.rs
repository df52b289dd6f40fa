//! crates/doc_chat_core/src/viewer.rs
//!
//! Pagination, zoom and load state for the document renderer.
//!
//! Out-of-range requests are clamped rather than rejected: citations may point at
//! pages from a differently paginated extraction, and toolbar buttons simply go
//! inert at the bounds.

use std::fmt;
use tracing::{debug, info, warn};

pub const MIN_ZOOM_PERCENT: u16 = 50;
pub const MAX_ZOOM_PERCENT: u16 = 200;
pub const ZOOM_STEP_PERCENT: u16 = 25;
pub const DEFAULT_ZOOM_PERCENT: u16 = 100;

/// A zoom level that is always one of 50, 75, ..., 200.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Zoom(u16);

impl Zoom {
    /// Clamps `percent` into range and snaps it to the nearest step.
    pub fn snap(percent: i32) -> Self {
        let min = i32::from(MIN_ZOOM_PERCENT);
        let step = i32::from(ZOOM_STEP_PERCENT);
        let clamped = percent.clamp(min, i32::from(MAX_ZOOM_PERCENT));
        // Steps are odd, so a value is never exactly halfway between two of them.
        let steps = (clamped - min + step / 2) / step;
        Zoom((min + steps * step) as u16)
    }

    pub fn percent(self) -> u16 {
        self.0
    }

    /// Scale factor for the renderer, e.g. `1.25` for 125%.
    pub fn scale(self) -> f32 {
        f32::from(self.0) / 100.0
    }

    fn zoomed_in(self) -> Self {
        Zoom::snap(i32::from(self.0) + i32::from(ZOOM_STEP_PERCENT))
    }

    fn zoomed_out(self) -> Self {
        Zoom::snap(i32::from(self.0) - i32::from(ZOOM_STEP_PERCENT))
    }
}

impl Default for Zoom {
    fn default() -> Self {
        Zoom(DEFAULT_ZOOM_PERCENT)
    }
}

impl fmt::Display for Zoom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Loading,
    Loaded,
    Error {
        reason: String,
    },
}

/// Instruction for the renderer to draw one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderRequest {
    pub page: u32,
    pub zoom: Zoom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStep {
    Previous,
    Next,
}

impl PageStep {
    fn delta(self) -> i64 {
        match self {
            PageStep::Previous => -1,
            PageStep::Next => 1,
        }
    }
}

/// View state of the document renderer.
///
/// Once `Loaded`, `1 <= current_page <= total_pages` always holds. Before that the
/// current page is held but nothing is sent to the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerState {
    current_page: u32,
    total_pages: Option<u32>,
    zoom: Zoom,
    load_state: LoadState,
}

impl Default for ViewerState {
    fn default() -> Self {
        Self {
            current_page: 1,
            total_pages: None,
            zoom: Zoom::default(),
            load_state: LoadState::Loading,
        }
    }
}

impl ViewerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn total_pages(&self) -> Option<u32> {
        self.total_pages
    }

    pub fn zoom(&self) -> Zoom {
        self.zoom
    }

    pub fn load_state(&self) -> &LoadState {
        &self.load_state
    }

    pub fn is_loaded(&self) -> bool {
        self.load_state == LoadState::Loaded
    }

    /// What the renderer should currently show, if anything.
    pub fn render_request(&self) -> Option<RenderRequest> {
        self.is_loaded().then_some(RenderRequest {
            page: self.current_page,
            zoom: self.zoom,
        })
    }

    /// Called by the renderer once the page count is known.
    pub fn set_total_pages(&mut self, total: u32) -> Option<RenderRequest> {
        if total == 0 {
            self.report_load_error("renderer reported a document without pages");
            return None;
        }
        self.total_pages = Some(total);
        if self.current_page > total {
            debug!("Clamping held page {} to {total}.", self.current_page);
            self.current_page = total;
        }
        self.load_state = LoadState::Loaded;
        info!("Viewer loaded {total} pages, showing page {}.", self.current_page);
        self.render_request()
    }

    /// Moves to `page`, clamped into `[1, total_pages]`.
    pub fn go_to(&mut self, page: i64) -> Option<RenderRequest> {
        let upper = i64::from(self.total_pages.unwrap_or(u32::MAX));
        let target = page.clamp(1, upper) as u32;
        if i64::from(target) != page {
            debug!("Clamped page request {page} to {target}.");
        }
        if target == self.current_page {
            return None;
        }
        self.current_page = target;
        self.render_request()
    }

    /// One page back or forward; inert at either end.
    pub fn step_page(&mut self, step: PageStep) -> Option<RenderRequest> {
        let blocked = match step {
            PageStep::Previous => !self.can_go_previous(),
            PageStep::Next => !self.can_go_next(),
        };
        if blocked {
            return None;
        }
        self.go_to(i64::from(self.current_page) + step.delta())
    }

    pub fn can_go_previous(&self) -> bool {
        self.current_page > 1
    }

    pub fn can_go_next(&self) -> bool {
        self.total_pages.is_some_and(|total| self.current_page < total)
    }

    /// Snaps to the nearest valid zoom step within `[50, 200]`.
    pub fn set_zoom(&mut self, percent: i32) -> Option<RenderRequest> {
        self.apply_zoom(Zoom::snap(percent))
    }

    pub fn zoom_in(&mut self) -> Option<RenderRequest> {
        self.apply_zoom(self.zoom.zoomed_in())
    }

    pub fn zoom_out(&mut self) -> Option<RenderRequest> {
        self.apply_zoom(self.zoom.zoomed_out())
    }

    pub fn can_zoom_in(&self) -> bool {
        self.zoom.percent() < MAX_ZOOM_PERCENT
    }

    pub fn can_zoom_out(&self) -> bool {
        self.zoom.percent() > MIN_ZOOM_PERCENT
    }

    fn apply_zoom(&mut self, zoom: Zoom) -> Option<RenderRequest> {
        if zoom == self.zoom {
            return None;
        }
        self.zoom = zoom;
        self.render_request()
    }

    /// The renderer could not load or draw the document. Page and zoom are kept so a
    /// reload resumes at the same view.
    pub fn report_load_error(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Viewer load error: {reason}");
        self.load_state = LoadState::Error { reason };
    }

    /// Moves an errored viewer back to `Loading` for another attempt.
    pub fn begin_reload(&mut self) -> bool {
        if !matches!(self.load_state, LoadState::Error { .. }) {
            return false;
        }
        self.load_state = LoadState::Loading;
        true
    }

    /// Forgets the previous document's pagination. Zoom is a viewer preference and stays.
    pub fn reset_for_new_document(&mut self) {
        self.current_page = 1;
        self.total_pages = None;
        self.load_state = LoadState::Loading;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(total: u32) -> ViewerState {
        let mut viewer = ViewerState::new();
        viewer.set_total_pages(total);
        viewer
    }

    #[test]
    fn go_to_clamps_into_page_range() {
        for total in [1u32, 2, 5, 10] {
            for page in [-3i64, 0, 1, 2, 3, 7, 10, 11, 1_000] {
                let mut viewer = loaded(total);
                viewer.go_to(page);
                assert_eq!(
                    i64::from(viewer.current_page()),
                    page.clamp(1, i64::from(total)),
                    "page {page} of {total}"
                );
            }
        }
    }

    #[test]
    fn go_to_emits_render_request_only_when_loaded() {
        let mut viewer = ViewerState::new();
        assert_eq!(viewer.go_to(4), None);
        assert_eq!(viewer.current_page(), 4);

        let request = viewer.set_total_pages(3).unwrap();
        assert_eq!(request.page, 3);
        assert_eq!(viewer.current_page(), 3);
        assert_eq!(
            viewer.go_to(1),
            Some(RenderRequest {
                page: 1,
                zoom: Zoom::default()
            })
        );
        assert_eq!(viewer.go_to(1), None);
    }

    #[test]
    fn step_page_is_inert_at_bounds() {
        let mut viewer = loaded(2);
        assert!(!viewer.can_go_previous());
        assert_eq!(viewer.step_page(PageStep::Previous), None);
        assert_eq!(viewer.current_page(), 1);

        viewer.step_page(PageStep::Next);
        assert_eq!(viewer.current_page(), 2);
        assert!(!viewer.can_go_next());
        assert_eq!(viewer.step_page(PageStep::Next), None);
        assert_eq!(viewer.current_page(), 2);
    }

    #[test]
    fn zoom_snaps_to_steps_and_is_idempotent() {
        let cases = [
            (-10, 50),
            (50, 50),
            (62, 50),
            (63, 75),
            (99, 100),
            (112, 100),
            (113, 125),
            (188, 200),
            (200, 200),
            (900, 200),
        ];
        for (input, expected) in cases {
            let mut viewer = loaded(1);
            viewer.set_zoom(input);
            assert_eq!(viewer.zoom().percent(), expected, "input {input}");
            viewer.set_zoom(input);
            assert_eq!(viewer.zoom().percent(), expected, "input {input} repeated");
            assert_eq!((expected - MIN_ZOOM_PERCENT) % ZOOM_STEP_PERCENT, 0);
        }
    }

    #[test]
    fn zoom_buttons_stop_at_bounds() {
        let mut viewer = loaded(1);
        for _ in 0..10 {
            viewer.zoom_in();
        }
        assert_eq!(viewer.zoom().percent(), 200);
        assert!(!viewer.can_zoom_in());
        assert_eq!(viewer.zoom_in(), None);

        for _ in 0..10 {
            viewer.zoom_out();
        }
        assert_eq!(viewer.zoom().percent(), 50);
        assert!(!viewer.can_zoom_out());
    }

    #[test]
    fn load_error_keeps_view_for_reload() {
        let mut viewer = loaded(8);
        viewer.go_to(6);
        viewer.set_zoom(150);
        viewer.report_load_error("worker crashed");
        assert_eq!(
            viewer.load_state(),
            &LoadState::Error {
                reason: "worker crashed".to_string()
            }
        );
        assert_eq!(viewer.render_request(), None);

        assert!(viewer.begin_reload());
        assert_eq!(viewer.load_state(), &LoadState::Loading);
        let request = viewer.set_total_pages(8).unwrap();
        assert_eq!(request.page, 6);
        assert_eq!(request.zoom.percent(), 150);
    }

    #[test]
    fn zero_pages_is_a_load_error() {
        let mut viewer = ViewerState::new();
        assert_eq!(viewer.set_total_pages(0), None);
        assert!(matches!(viewer.load_state(), LoadState::Error { .. }));
    }

    #[test]
    fn reset_keeps_zoom() {
        let mut viewer = loaded(4);
        viewer.go_to(3);
        viewer.set_zoom(75);
        viewer.reset_for_new_document();
        assert_eq!(viewer.current_page(), 1);
        assert_eq!(viewer.total_pages(), None);
        assert_eq!(viewer.zoom().percent(), 75);
        assert_eq!(viewer.load_state(), &LoadState::Loading);
    }
}
