//! The managed display surface and its visibility state machine.
//!
//! The surface is created hidden. The only path to visible is a
//! `LoadSucceeded` event; failures and timers never reveal it.

use reqwest::Url;
use serde::Serialize;

use crate::error::SurfaceError;
use crate::events::{EventBus, SurfaceEvent, SHELL_SOURCE};

pub const INITIAL_WIDTH: f64 = 1280.0;
pub const INITIAL_HEIGHT: f64 = 800.0;
/// `#111111`
pub const BACKGROUND_RGBA: (u8, u8, u8, u8) = (0x11, 0x11, 0x11, 0xff);

/// A window able to display the frontend. Implemented over a Tauri webview in
/// the desktop build.
pub trait Surface {
    /// Starts loading `url`. `Ok` means the load was accepted, not finished;
    /// completion arrives as a [`SurfaceEvent`].
    fn navigate(&self, url: &str) -> Result<(), SurfaceError>;

    fn show(&self) -> Result<(), SurfaceError>;

    fn open_devtools(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation {
    Allow,
    /// Hand the URL to the OS default handler and keep the surface where it is.
    OpenExternally,
    /// Drop the request.
    Deny,
}

/// Keeps the surface on the frontend origin. Anything else (links to docs,
/// `target=_blank` pages) goes to the system browser.
#[derive(Debug, Clone)]
pub struct NavigationPolicy {
    frontend: Url,
}

impl NavigationPolicy {
    pub fn new(frontend_url: &str) -> Result<Self, SurfaceError> {
        let frontend = Url::parse(frontend_url).map_err(|err| SurfaceError::InvalidUrl {
            url: frontend_url.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self { frontend })
    }

    /// True for pages served by the frontend, i.e. real content rather than
    /// the placeholder the window starts on.
    pub fn is_content(&self, url: &Url) -> bool {
        url.origin() == self.frontend.origin()
    }

    pub fn decide(&self, url: &Url) -> Navigation {
        if url.scheme() == "about" || self.is_content(url) {
            Navigation::Allow
        } else {
            Navigation::OpenExternally
        }
    }

    /// Requests for a new top-level window (`target=_blank`, `window.open`)
    /// never open inside the shell, not even for frontend pages.
    pub fn on_new_window(&self, url: &Url) -> Navigation {
        if url.scheme() == "about" {
            Navigation::Deny
        } else {
            Navigation::OpenExternally
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceState {
    Hidden,
    Loading,
    LoadFailedRetrying,
    Ready,
    Closed,
}

pub struct SurfaceController<S> {
    surface: S,
    bus: EventBus,
    state: SurfaceState,
    visible: bool,
}

impl<S: Surface> SurfaceController<S> {
    pub fn new(surface: S, bus: EventBus) -> Self {
        Self {
            surface,
            bus,
            state: SurfaceState::Hidden,
            visible: false,
        }
    }

    pub fn state(&self) -> SurfaceState {
        self.state
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// Asks the surface to load `url`. A rejected load is reported on the
    /// event bus and returned so the caller can decide on a retry.
    pub fn load(&mut self, url: &str) -> Result<(), SurfaceError> {
        if self.state == SurfaceState::Closed {
            return Err(SurfaceError::Closed);
        }
        if self.state != SurfaceState::Ready {
            self.state = SurfaceState::Loading;
        }
        match self.surface.navigate(url) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.bus.surface(SurfaceEvent::LoadFailed {
                    code: None,
                    description: err.to_string(),
                    url: url.to_string(),
                });
                if self.state == SurfaceState::Loading {
                    self.state = SurfaceState::LoadFailedRetrying;
                }
                Err(err)
            }
        }
    }

    /// Applies a surface event to the state machine.
    pub fn handle(&mut self, event: &SurfaceEvent) {
        match event {
            SurfaceEvent::LoadSucceeded { .. } => self.reveal(),
            SurfaceEvent::LoadFailed { .. } => {
                if self.state == SurfaceState::Loading {
                    self.state = SurfaceState::LoadFailedRetrying;
                }
            }
            SurfaceEvent::LoadStarted { .. } | SurfaceEvent::Console { .. } => {}
        }
    }

    pub fn open_devtools(&self) {
        if self.state != SurfaceState::Closed {
            self.surface.open_devtools();
        }
    }

    pub fn mark_closed(&mut self) {
        self.state = SurfaceState::Closed;
    }

    fn reveal(&mut self) {
        if self.state == SurfaceState::Closed {
            return;
        }
        if self.visible {
            self.state = SurfaceState::Ready;
            return;
        }
        match self.surface.show() {
            Ok(()) => {
                self.visible = true;
                self.state = SurfaceState::Ready;
            }
            Err(err) => log::warn!(target: SHELL_SOURCE, "failed to show window: {err}"),
        }
    }
}
