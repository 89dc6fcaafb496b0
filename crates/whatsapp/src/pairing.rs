//! Interactive pairing: one caller waits for the first QR payload of a fresh session.

use std::sync::{Mutex, MutexGuard, PoisonError};

use {
    base64::{Engine as _, engine::general_purpose::STANDARD},
    qrcode::{
        QrCode,
        render::{svg, unicode},
    },
    tokio::sync::oneshot,
};

use crate::error::PairingError;

/// What the interactive caller receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    /// Pairing payload to scan, raw and as an embeddable image URL.
    Code { qr: String, data_url: String },
    /// The stored credentials were still valid; no pairing was needed.
    Authenticated,
}

pub type PairingResult = Result<PairingOutcome, PairingError>;

/// Render a pairing payload as a `data:image/svg+xml;base64,...` URL.
pub fn render_data_url(payload: &str) -> Result<String, PairingError> {
    let code = QrCode::new(payload.as_bytes()).map_err(|e| PairingError::Render(e.to_string()))?;
    let image = code
        .render::<svg::Color>()
        .min_dimensions(256, 256)
        .build();
    Ok(format!(
        "data:image/svg+xml;base64,{}",
        STANDARD.encode(image)
    ))
}

/// Render a pairing payload for a terminal using half-block characters.
pub fn render_terminal(payload: &str) -> Result<String, PairingError> {
    let code = QrCode::new(payload.as_bytes()).map_err(|e| PairingError::Render(e.to_string()))?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

/// What the dispatcher should do with a pairing payload.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum QrAction {
    /// No interactive caller; keep going.
    Ignore,
    /// The payload went to the caller; keep the session up for the scan.
    Delivered,
    /// A code was already handed out and has expired unscanned, or rendering
    /// failed. The session must be torn down.
    TearDown,
}

enum SlotState {
    Detached,
    Waiting(oneshot::Sender<PairingResult>),
    Delivered,
}

/// Per-session attachment point for at most one interactive caller.
pub(crate) struct PairingSlot {
    state: Mutex<SlotState>,
}

impl PairingSlot {
    pub(crate) fn detached() -> Self {
        Self {
            state: Mutex::new(SlotState::Detached),
        }
    }

    pub(crate) fn attached() -> (Self, oneshot::Receiver<PairingResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                state: Mutex::new(SlotState::Waiting(tx)),
            },
            rx,
        )
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        !matches!(*self.lock(), SlotState::Detached)
    }

    pub(crate) fn on_qr(&self, payload: &str) -> QrAction {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, SlotState::Detached) {
            SlotState::Detached => QrAction::Ignore,
            SlotState::Waiting(tx) => match render_data_url(payload) {
                Ok(data_url) => {
                    let _ = tx.send(Ok(PairingOutcome::Code {
                        qr: payload.to_string(),
                        data_url,
                    }));
                    *state = SlotState::Delivered;
                    QrAction::Delivered
                },
                Err(e) => {
                    let _ = tx.send(Err(e));
                    QrAction::TearDown
                },
            },
            SlotState::Delivered => QrAction::TearDown,
        }
    }

    /// The session authenticated; any waiting caller learns no code is needed.
    pub(crate) fn on_authenticated(&self) {
        if let SlotState::Waiting(tx) = std::mem::replace(&mut *self.lock(), SlotState::Detached) {
            let _ = tx.send(Ok(PairingOutcome::Authenticated));
        }
    }

    /// The session ended; a waiting caller receives `error`.
    pub(crate) fn fail(&self, error: PairingError) {
        if let SlotState::Waiting(tx) = std::mem::replace(&mut *self.lock(), SlotState::Detached) {
            let _ = tx.send(Err(error));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn data_url_is_embeddable_svg() {
        let url = render_data_url("2@abc,def,ghi").unwrap();
        let encoded = url.strip_prefix("data:image/svg+xml;base64,").unwrap();
        let svg = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();
        assert!(svg.contains("<svg"));
    }

    #[test]
    fn terminal_render_is_nonempty() {
        assert!(!render_terminal("2@abc").unwrap().is_empty());
    }

    #[test]
    fn detached_slot_ignores_codes() {
        let slot = PairingSlot::detached();
        assert_eq!(slot.on_qr("2@abc"), QrAction::Ignore);
        assert_eq!(slot.on_qr("2@def"), QrAction::Ignore);
        assert!(!slot.is_pending());
    }

    #[tokio::test]
    async fn first_code_delivered_second_tears_down() {
        let (slot, rx) = PairingSlot::attached();
        assert_eq!(slot.on_qr("2@abc"), QrAction::Delivered);
        match rx.await.unwrap().unwrap() {
            PairingOutcome::Code { qr, data_url } => {
                assert_eq!(qr, "2@abc");
                assert!(data_url.starts_with("data:image/svg+xml;base64,"));
            },
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(slot.is_pending());
        assert_eq!(slot.on_qr("2@def"), QrAction::TearDown);
        assert!(!slot.is_pending());
    }

    #[tokio::test]
    async fn authenticated_before_code() {
        let (slot, rx) = PairingSlot::attached();
        slot.on_authenticated();
        assert_eq!(rx.await.unwrap(), Ok(PairingOutcome::Authenticated));
        assert_eq!(slot.on_qr("2@late"), QrAction::Ignore);
    }

    #[tokio::test]
    async fn failure_reaches_waiting_caller_once() {
        let (slot, rx) = PairingSlot::attached();
        slot.fail(PairingError::Removed);
        slot.fail(PairingError::Removed);
        assert_eq!(rx.await.unwrap(), Err(PairingError::Removed));
    }
}
