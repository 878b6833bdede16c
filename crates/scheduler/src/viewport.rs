//! Viewport tracking
//!
//! Turns raw scroll samples into the three signals the render coordinator
//! cares about:
//!
//! 1. `VisibilityChanged`: emitted on the sample where the set of intersecting
//!    pages changes. Never debounced; it drives prefetch.
//! 2. `CenterPageChanged`: the page under the viewport center. Suppressed while
//!    a programmatic navigation is in flight.
//! 3. `Settled`: the viewport has been still for the settle window.
//!
//! Navigation completion is detected by sampling, not by guessing a duration:
//! once the scroll position stops moving (within an epsilon) for two
//! consecutive samples, or the platform reports scroll end, the navigation is
//! done and its target page is published.

use std::time::{Duration, Instant};

/// Axis-aligned rectangle in document layout coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn contains_point(&self, (px, py): (f32, f32)) -> bool {
        px >= self.x && px < self.right() && py >= self.y && py < self.bottom()
    }

    pub fn intersection_area(&self, other: &Rect) -> f32 {
        let width = self.right().min(other.right()) - self.x.max(other.x);
        let height = self.bottom().min(other.bottom()) - self.y.max(other.y);
        if width <= 0.0 || height <= 0.0 {
            0.0
        } else {
            width * height
        }
    }
}

/// One page intersecting the viewport
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageVisibility {
    pub page: u32,
    /// Visible fraction of the page's area, `(0.0, 1.0]`
    pub ratio: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewportEvent {
    VisibilityChanged { visible: Vec<PageVisibility>, near: Vec<u32> },
    CenterPageChanged(u32),
    Settled { center_page: u32 },
}

#[derive(Debug, Clone)]
pub struct ViewportTrackerConfig {
    /// Quiet period after the last movement before `Settled` fires
    pub settle_window: Duration,
    /// Movement below this many layout units counts as standing still
    pub navigation_epsilon: f32,
    /// Consecutive still samples that complete a navigation
    pub stable_samples: u32,
    /// Pages either side of the visible range reported as near
    pub near_radius: u32,
}

impl Default for ViewportTrackerConfig {
    fn default() -> Self {
        Self {
            settle_window: Duration::from_millis(100),
            navigation_epsilon: 1.0,
            stable_samples: 2,
            near_radius: 2,
        }
    }
}

/// Tracker state; exactly one at a time
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackerState {
    /// No movement since the last `Settled`
    Idle,
    /// Moving, or moved less than a settle window ago
    Settling { last_change: Instant },
    /// Programmatic jump in flight
    Navigating { target: u32, last_position: Option<(f32, f32)>, stable_samples: u32 },
}

#[derive(Debug)]
pub struct ViewportTracker {
    config: ViewportTrackerConfig,
    pages: Vec<Rect>,
    state: TrackerState,
    visible: Vec<u32>,
    current_page: u32,
    last_position: Option<(f32, f32)>,
}

impl ViewportTracker {
    pub fn new(config: ViewportTrackerConfig) -> Self {
        Self {
            config,
            pages: Vec::new(),
            state: TrackerState::Idle,
            visible: Vec::new(),
            current_page: 0,
            last_position: None,
        }
    }

    /// Replace the page layout (after open, zoom or scroll-mode change)
    pub fn set_page_layout(&mut self, pages: Vec<Rect>) {
        self.pages = pages;
        self.visible.clear();
        self.last_position = None;
        self.current_page = self.current_page.min(self.pages.len().saturating_sub(1) as u32);
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn is_navigating(&self) -> bool {
        matches!(self.state, TrackerState::Navigating { .. })
    }

    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn visible_pages(&self) -> &[u32] {
        &self.visible
    }

    /// Feed a viewport sample
    pub fn on_scroll(&mut self, viewport: Rect, now: Instant) -> Vec<ViewportEvent> {
        let mut events = Vec::new();
        let position = (viewport.x, viewport.y);
        let moved = self.last_position.map_or(true, |last| self.moved(last, position));
        self.last_position = Some(position);

        let visible = self.intersecting(&viewport);
        let pages: Vec<u32> = visible.iter().map(|v| v.page).collect();
        if pages != self.visible {
            self.visible = pages;
            events.push(ViewportEvent::VisibilityChanged { near: self.near_pages(), visible });
        }

        match self.state {
            TrackerState::Navigating { target, last_position, stable_samples } => {
                let stable = match last_position {
                    Some(last) if !self.moved(last, position) => stable_samples + 1,
                    _ => 0,
                };

                if stable >= self.config.stable_samples {
                    events.extend(self.finish_navigation(target, now));
                } else {
                    self.state = TrackerState::Navigating {
                        target,
                        last_position: Some(position),
                        stable_samples: stable,
                    };
                }
            }
            TrackerState::Idle | TrackerState::Settling { .. } => {
                if let Some(center) = self.center_page(&viewport) {
                    if center != self.current_page {
                        self.current_page = center;
                        events.push(ViewportEvent::CenterPageChanged(center));
                    }
                }
                if moved {
                    self.state = TrackerState::Settling { last_change: now };
                }
            }
        }

        events
    }

    /// Advance time; emits `Settled` once the settle window has passed
    pub fn tick(&mut self, now: Instant) -> Option<ViewportEvent> {
        match self.state {
            TrackerState::Settling { last_change }
                if now.saturating_duration_since(last_change) >= self.config.settle_window =>
            {
                self.state = TrackerState::Idle;
                Some(ViewportEvent::Settled { center_page: self.current_page })
            }
            _ => None,
        }
    }

    /// Start a programmatic jump to `target`
    pub fn begin_navigation(&mut self, target: u32) {
        tracing::debug!(page = target, "navigation started");
        self.state = TrackerState::Navigating { target, last_position: None, stable_samples: 0 };
    }

    /// Platform signal that a scroll animation finished
    pub fn on_scroll_end(&mut self, now: Instant) -> Vec<ViewportEvent> {
        match self.state {
            TrackerState::Navigating { target, .. } => self.finish_navigation(target, now),
            _ => Vec::new(),
        }
    }

    fn finish_navigation(&mut self, target: u32, now: Instant) -> Vec<ViewportEvent> {
        tracing::debug!(page = target, "navigation complete");
        self.state = TrackerState::Settling { last_change: now };
        if target != self.current_page {
            self.current_page = target;
            vec![ViewportEvent::CenterPageChanged(target)]
        } else {
            Vec::new()
        }
    }

    fn moved(&self, (x0, y0): (f32, f32), (x1, y1): (f32, f32)) -> bool {
        (x1 - x0).abs() >= self.config.navigation_epsilon
            || (y1 - y0).abs() >= self.config.navigation_epsilon
    }

    fn intersecting(&self, viewport: &Rect) -> Vec<PageVisibility> {
        self.pages
            .iter()
            .enumerate()
            .filter_map(|(index, page)| {
                let area = page.area();
                let overlap = page.intersection_area(viewport);
                (area > 0.0 && overlap > 0.0).then(|| PageVisibility {
                    page: index as u32,
                    ratio: (overlap / area).min(1.0),
                })
            })
            .collect()
    }

    /// Page under the viewport center, else the most visible page
    fn center_page(&self, viewport: &Rect) -> Option<u32> {
        let center = viewport.center();
        self.pages
            .iter()
            .position(|page| page.contains_point(center))
            .map(|index| index as u32)
            .or_else(|| {
                self.pages
                    .iter()
                    .enumerate()
                    .map(|(index, page)| (index, page.intersection_area(viewport)))
                    .filter(|(_, overlap)| *overlap > 0.0)
                    .max_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(index, _)| index as u32)
            })
    }

    fn near_pages(&self) -> Vec<u32> {
        let (Some(&first), Some(&last)) = (self.visible.first(), self.visible.last()) else {
            return Vec::new();
        };
        let page_count = self.pages.len() as u32;
        let radius = self.config.near_radius;

        let before = first.saturating_sub(radius)..first;
        let after = (last + 1)..(last + 1 + radius).min(page_count);
        before.chain(after).collect()
    }
}

impl Default for ViewportTracker {
    fn default() -> Self {
        Self::new(ViewportTrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_HEIGHT: f32 = 800.0;
    const GAP: f32 = 10.0;

    /// Ten 600x800 pages stacked vertically
    fn tracker() -> ViewportTracker {
        let mut tracker = ViewportTracker::default();
        tracker.set_page_layout(
            (0..10)
                .map(|i| Rect::new(0.0, i as f32 * (PAGE_HEIGHT + GAP), 600.0, PAGE_HEIGHT))
                .collect(),
        );
        tracker
    }

    fn viewport_at(y: f32) -> Rect {
        Rect::new(0.0, y, 600.0, 700.0)
    }

    fn page_top(page: u32) -> f32 {
        page as f32 * (PAGE_HEIGHT + GAP)
    }

    #[test]
    fn test_rect_intersection() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        assert_eq!(a.intersection_area(&Rect::new(5.0, 5.0, 10.0, 10.0)), 25.0);
        assert_eq!(a.intersection_area(&Rect::new(10.0, 0.0, 5.0, 5.0)), 0.0);
        assert!(a.contains_point((0.0, 9.9)));
        assert!(!a.contains_point((10.0, 5.0)));
    }

    #[test]
    fn test_visibility_reported_immediately() {
        let mut tracker = tracker();
        let start = Instant::now();

        let events = tracker.on_scroll(viewport_at(0.0), start);
        match &events[0] {
            ViewportEvent::VisibilityChanged { visible, near } => {
                assert_eq!(visible.len(), 1);
                assert_eq!(visible[0].page, 0);
                assert_eq!(near, &vec![1, 2]);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Straddle pages 0 and 1
        let events = tracker.on_scroll(viewport_at(500.0), start);
        assert!(matches!(
            &events[0],
            ViewportEvent::VisibilityChanged { visible, .. } if visible.len() == 2
        ));
        assert_eq!(tracker.visible_pages(), &[0, 1]);

        // Same page set: no new visibility event
        let events = tracker.on_scroll(viewport_at(520.0), start);
        assert!(!events.iter().any(|e| matches!(e, ViewportEvent::VisibilityChanged { .. })));
    }

    #[test]
    fn test_near_pages_clamped_to_document() {
        let mut tracker = tracker();
        let events = tracker.on_scroll(viewport_at(page_top(9)), Instant::now());
        assert!(matches!(
            &events[0],
            ViewportEvent::VisibilityChanged { near, .. } if near == &vec![7, 8]
        ));
    }

    #[test]
    fn test_center_page_follows_scroll() {
        let mut tracker = tracker();
        let now = Instant::now();

        tracker.on_scroll(viewport_at(0.0), now);
        let events = tracker.on_scroll(viewport_at(page_top(4)), now);
        assert!(events.contains(&ViewportEvent::CenterPageChanged(4)));
        assert_eq!(tracker.current_page(), 4);
    }

    #[test]
    fn test_settles_after_quiet_window() {
        let mut tracker = tracker();
        let start = Instant::now();

        tracker.on_scroll(viewport_at(page_top(3)), start);
        assert_eq!(tracker.tick(start + Duration::from_millis(50)), None);

        // Movement restarts the window
        tracker.on_scroll(viewport_at(page_top(3) + 40.0), start + Duration::from_millis(80));
        assert_eq!(tracker.tick(start + Duration::from_millis(150)), None);

        assert_eq!(
            tracker.tick(start + Duration::from_millis(180)),
            Some(ViewportEvent::Settled { center_page: 3 })
        );
        assert_eq!(tracker.state(), TrackerState::Idle);
        assert_eq!(tracker.tick(start + Duration::from_secs(5)), None);
    }

    #[test]
    fn test_navigation_suppresses_center_updates() {
        let mut tracker = tracker();
        let t = Instant::now();
        tracker.on_scroll(viewport_at(0.0), t);

        tracker.begin_navigation(6);
        assert!(tracker.is_navigating());

        // Smooth scroll passes through pages 2..5 without publishing them
        for page in 2..6 {
            let events = tracker.on_scroll(viewport_at(page_top(page)), t);
            assert!(!events.iter().any(|e| matches!(e, ViewportEvent::CenterPageChanged(_))));
            // Prefetch signal still flows
            assert!(events.iter().any(|e| matches!(e, ViewportEvent::VisibilityChanged { .. })));
        }
        assert_eq!(tracker.current_page(), 0);

        // Arrive, then two still samples complete the navigation
        let events = tracker.on_scroll(viewport_at(page_top(6)), t);
        assert!(!events.iter().any(|e| matches!(e, ViewportEvent::CenterPageChanged(_))));
        assert!(tracker.on_scroll(viewport_at(page_top(6) + 0.5), t).is_empty());
        let events = tracker.on_scroll(viewport_at(page_top(6)), t);
        assert_eq!(events, vec![ViewportEvent::CenterPageChanged(6)]);
        assert!(!tracker.is_navigating());

        assert_eq!(
            tracker.tick(t + Duration::from_millis(100)),
            Some(ViewportEvent::Settled { center_page: 6 })
        );
    }

    #[test]
    fn test_scroll_end_completes_navigation() {
        let mut tracker = tracker();
        let t = Instant::now();
        tracker.begin_navigation(8);
        tracker.on_scroll(viewport_at(page_top(7)), t);

        assert_eq!(tracker.on_scroll_end(t), vec![ViewportEvent::CenterPageChanged(8)]);
        assert!(matches!(tracker.state(), TrackerState::Settling { .. }));
        assert!(tracker.on_scroll_end(t).is_empty());
    }

    #[test]
    fn test_navigation_to_current_page_is_silent() {
        let mut tracker = tracker();
        let t = Instant::now();
        tracker.begin_navigation(0);
        assert!(tracker.on_scroll_end(t).is_empty());
        assert_eq!(tracker.current_page(), 0);
    }
}
