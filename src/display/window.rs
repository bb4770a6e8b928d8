//! Viewer window
//!
//! The render stage runs on a blocking worker while iced owns the main
//! thread, so the two meet in a [`FrameSlot`]: [`WindowSurface`] leaves the
//! newest frame there and [`ViewerWindow`] picks it up on its redraw tick.
//! Key presses travel the other way as [`KeyCommand`]s.

use iced::Event::{Keyboard, Window};
use iced::keyboard::key::Named;
use iced::keyboard::{Event, Key};
use iced::widget::{container, text};
use iced::window::{self, Id, Mode};
use iced::{Color, Element, Length, Size, Subscription, Task};
use image::RgbaImage;
use image::buffer::ConvertBuffer;
use log::{debug, info};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use super::renderer::{KeyCommand, RenderSurface};
use crate::config::app_name;
use crate::error::StreamError;
use crate::pipeline::types::DecodedFrame;

/// A frame converted for upload
pub struct WindowFrame {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

#[derive(Default)]
struct SlotInner {
    latest: Option<WindowFrame>,
    fullscreen: bool,
    closed: bool,
    /// Frames replaced before the window picked them up
    overwritten: u64,
}

/// Latest-wins hand-off between the render stage and the window
#[derive(Clone, Default)]
pub struct FrameSlot {
    inner: Arc<Mutex<SlotInner>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn put(&self, frame: WindowFrame) {
        let mut inner = self.lock();
        if inner.latest.replace(frame).is_some() {
            inner.overwritten += 1;
        }
    }

    pub fn take(&self) -> Option<WindowFrame> {
        self.lock().latest.take()
    }

    pub fn overwritten(&self) -> u64 {
        self.lock().overwritten
    }

    fn set_fullscreen(&self, fullscreen: bool) {
        self.lock().fullscreen = fullscreen;
    }

    pub fn fullscreen(&self) -> bool {
        self.lock().fullscreen
    }

    /// The session is over; the window closes on its next tick
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.latest = None;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Render surface feeding a [`ViewerWindow`]
pub struct WindowSurface {
    slot: FrameSlot,
}

impl WindowSurface {
    pub fn new(slot: FrameSlot) -> Self {
        Self { slot }
    }
}

impl RenderSurface for WindowSurface {
    fn name(&self) -> &str {
        "window"
    }

    fn present(&mut self, frame: &DecodedFrame) -> Result<(), StreamError> {
        let rgba: RgbaImage = frame.image.convert();
        self.slot.put(WindowFrame {
            sequence: frame.sequence,
            width: rgba.width(),
            height: rgba.height(),
            rgba: rgba.into_raw(),
        });
        Ok(())
    }

    fn set_fullscreen(&mut self, fullscreen: bool) {
        self.slot.set_fullscreen(fullscreen);
    }
}

/// Receiver key bindings for window input
pub fn key_command(key: &Key) -> Option<KeyCommand> {
    match key {
        Key::Named(Named::Escape) => Some(KeyCommand::Stop),
        Key::Named(Named::Space) => Some(KeyCommand::TogglePause),
        Key::Character(c) => KeyCommand::parse(c.as_str()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub enum ViewerEvent {
    Tick,
    Key(KeyCommand),
    Opened(Id),
}

pub struct ViewerWindow {
    slot: FrameSlot,
    keys: mpsc::Sender<KeyCommand>,
    window: Option<Id>,
    picture: Option<iced::widget::image::Handle>,
    size: (u32, u32),
    last_sequence: Option<u64>,
    fullscreen: bool,
}

impl ViewerWindow {
    /// Redraw tick; faster than any frame rate the sender offers
    const TICK: Duration = Duration::from_millis(8);

    pub fn new(slot: FrameSlot, keys: mpsc::Sender<KeyCommand>) -> Self {
        Self {
            slot,
            keys,
            window: None,
            picture: None,
            size: (0, 0),
            last_sequence: None,
            fullscreen: false,
        }
    }

    /// Open the window and block until it is closed or the slot is
    pub fn run(slot: FrameSlot, keys: mpsc::Sender<KeyCommand>) -> iced::Result {
        iced::application(
            move || ViewerWindow::new(slot.clone(), keys.clone()),
            ViewerWindow::update,
            ViewerWindow::view,
        )
        .title(ViewerWindow::title)
        .window_size(Size::new(1280.0, 720.0))
        .subscription(ViewerWindow::subscription)
        .run()
    }

    pub fn title(&self) -> String {
        match self.size {
            (0, 0) => format!("{} - waiting for sender", app_name()),
            (w, h) => format!("{} - {}x{}", app_name(), w, h),
        }
    }

    pub fn update(&mut self, event: ViewerEvent) -> Task<ViewerEvent> {
        match event {
            ViewerEvent::Opened(id) => {
                self.window.get_or_insert(id);
                Task::none()
            }
            ViewerEvent::Key(command) => {
                if self.keys.try_send(command).is_err() {
                    debug!("ViewerWindow: command queue full, {:?} dropped", command);
                }
                Task::none()
            }
            ViewerEvent::Tick => {
                if self.slot.is_closed() {
                    info!(
                        "ViewerWindow: session over, closing ({} frames replaced before display)",
                        self.slot.overwritten()
                    );
                    return iced::exit();
                }
                if let Some(frame) = self.slot.take() {
                    self.size = (frame.width, frame.height);
                    self.last_sequence = Some(frame.sequence);
                    self.picture = Some(iced::widget::image::Handle::from_rgba(
                        frame.width,
                        frame.height,
                        frame.rgba,
                    ));
                }
                let wanted = self.slot.fullscreen();
                match self.window {
                    Some(id) if wanted != self.fullscreen => {
                        self.fullscreen = wanted;
                        window::set_mode(id, if wanted { Mode::Fullscreen } else { Mode::Windowed })
                    }
                    _ => Task::none(),
                }
            }
        }
    }

    pub fn view(&self) -> Element<'_, ViewerEvent> {
        let content: Element<'_, ViewerEvent> = match &self.picture {
            Some(handle) => iced::widget::image(handle.clone())
                .content_fit(iced::ContentFit::Contain)
                .width(Length::Fill)
                .height(Length::Fill)
                .into(),
            None => text("Waiting for the sender...").color(Color::WHITE).into(),
        };
        container(content)
            .center(Length::Fill)
            .style(|_| container::Style {
                background: Some(Color::BLACK.into()),
                ..container::Style::default()
            })
            .into()
    }

    pub fn subscription(&self) -> Subscription<ViewerEvent> {
        Subscription::batch([
            iced::time::every(Self::TICK).map(|_| ViewerEvent::Tick),
            iced::event::listen_with(|event, _status, id| match event {
                Keyboard(Event::KeyPressed { key, .. }) => key_command(&key).map(ViewerEvent::Key),
                Window(window::Event::Opened { .. }) => Some(ViewerEvent::Opened(id)),
                Window(window::Event::Focused) => Some(ViewerEvent::Opened(id)),
                _ => None,
            }),
        ])
    }
}
