use std::sync::{
    mpsc::{self, Receiver, Sender},
    Mutex,
};

use verbi_core::{AnimationState, Role, StageEvent};

/// Receives turn progress from the worker thread.
///
/// Implementations must be safe to call from a thread that is not the UI
/// thread; getting the event onto the UI's own context is their job.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: StageEvent);
}

type Callback<T> = Box<dyn Fn(T) + Send + Sync>;

/// Four optional registration points, each invoked directly on the caller's thread.
#[derive(Default)]
pub struct CallbackSink {
    on_status: Option<Callback<String>>,
    on_animation: Option<Callback<AnimationState>>,
    on_message: Option<Box<dyn Fn(Role, String) + Send + Sync>>,
    on_error: Option<Callback<String>>,
}

impl CallbackSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_status(mut self, f: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_status = Some(Box::new(f));
        self
    }

    pub fn on_animation(mut self, f: impl Fn(AnimationState) + Send + Sync + 'static) -> Self {
        self.on_animation = Some(Box::new(f));
        self
    }

    pub fn on_message(mut self, f: impl Fn(Role, String) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl EventSink for CallbackSink {
    fn emit(&self, event: StageEvent) {
        match event {
            StageEvent::StatusChanged(s) => {
                if let Some(f) = &self.on_status {
                    f(s)
                }
            }
            StageEvent::AnimationChanged(a) => {
                if let Some(f) = &self.on_animation {
                    f(a)
                }
            }
            StageEvent::MessageAppended { role, text } => {
                if let Some(f) = &self.on_message {
                    f(role, text)
                }
            }
            StageEvent::Failed(reason) => {
                if let Some(f) = &self.on_error {
                    f(reason)
                }
            }
        }
    }
}

/// Worker half of the UI channel.
pub struct ChannelSink {
    tx: Mutex<Sender<StageEvent>>,
}

impl EventSink for ChannelSink {
    fn emit(&self, event: StageEvent) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if tx.send(event).is_err() {
            tracing::debug!("ui channel closed; event dropped");
        }
    }
}

/// UI half of the channel, drained once per event-loop tick.
pub struct UiEvents {
    rx: Receiver<StageEvent>,
}

impl UiEvents {
    /// Everything queued right now, in emission order. Never blocks.
    pub fn drain(&self) -> Vec<StageEvent> {
        self.rx.try_iter().collect()
    }
}

pub fn ui_channel() -> (ChannelSink, UiEvents) {
    let (tx, rx) = mpsc::channel();
    (ChannelSink { tx: Mutex::new(tx) }, UiEvents { rx })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn callback_sink_routes_each_variant() {
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        let sink = CallbackSink::new()
            .on_status(move |s| a.lock().unwrap().push(format!("status:{s}")))
            .on_animation(move |s| b.lock().unwrap().push(format!("anim:{s}")))
            .on_message(move |r, t| c.lock().unwrap().push(format!("msg:{r}:{t}")));

        sink.emit(StageEvent::status("Listening..."));
        sink.emit(StageEvent::AnimationChanged(AnimationState::Listening));
        sink.emit(StageEvent::MessageAppended {
            role: Role::User,
            text: "Hi".to_string(),
        });
        // No error callback registered: silently ignored.
        sink.emit(StageEvent::Failed("x".to_string()));

        assert_eq!(
            *log.lock().unwrap(),
            ["status:Listening...", "anim:listening", "msg:user:Hi"]
        );
    }

    #[test]
    fn channel_preserves_order_across_threads() {
        let (sink, ui) = ui_channel();
        let sink = Arc::new(sink);
        let worker = {
            let sink = sink.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    sink.emit(StageEvent::status(format!("s{i}")));
                }
            })
        };
        worker.join().unwrap();
        let got: Vec<String> = ui
            .drain()
            .into_iter()
            .map(|e| match e {
                StageEvent::StatusChanged(s) => s,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(got.len(), 50);
        assert_eq!(got[0], "s0");
        assert_eq!(got[49], "s49");
        assert!(ui.drain().is_empty());
    }

    #[test]
    fn emit_after_ui_dropped_does_not_panic() {
        let (sink, ui) = ui_channel();
        drop(ui);
        sink.emit(StageEvent::status("Ready"));
    }
}
