//! Per-type message handler registration and dispatch.

use super::message::{ConnectionId, Message, MessageHeader, NetMessage};
use super::messages::MessageBody;
use super::protocol::MessageKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerControl {
    Keep,
    /// Stop receiving messages. The handler is removed after the tick.
    Dispose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    One(ConnectionId),
    All,
    AllExcept(ConnectionId),
}

/// Messages queued by handlers, flushed by the session after dispatch.
#[derive(Debug, Default)]
pub struct Outbox {
    queued: Vec<(Target, MessageBody)>,
}

impl Outbox {
    pub fn push(&mut self, target: Target, body: impl Into<MessageBody>) {
        self.queued.push((target, body.into()));
    }

    pub fn take(&mut self) -> Vec<(Target, MessageBody)> {
        std::mem::take(&mut self.queued)
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

/// What a handler sees besides the message itself.
pub struct HandlerContext<'a, G> {
    pub game: &'a mut G,
    pub header: MessageHeader,
    /// Age of the message in frames, 0 for messages without a frame number.
    pub frames_ago: f32,
    outbox: &'a mut Outbox,
}

impl<G> HandlerContext<'_, G> {
    pub fn connection_id(&self) -> ConnectionId {
        self.header.connection_id
    }

    pub fn reply(&mut self, body: impl Into<MessageBody>) {
        let target = Target::One(self.header.connection_id);
        self.outbox.push(target, body);
    }

    pub fn send_to(&mut self, connection_id: ConnectionId, body: impl Into<MessageBody>) {
        self.outbox.push(Target::One(connection_id), body);
    }

    pub fn broadcast(&mut self, body: impl Into<MessageBody>) {
        self.outbox.push(Target::All, body);
    }

    /// Sends to everyone but the connection the message came from.
    pub fn forward(&mut self, body: impl Into<MessageBody>) {
        let target = Target::AllExcept(self.header.connection_id);
        self.outbox.push(target, body);
    }
}

type ErasedHandler<G> = Box<dyn FnMut(&Message, &mut HandlerContext<'_, G>) -> HandlerControl + Send>;

struct Slot<G> {
    id: HandlerId,
    key: MessageKey,
    disposed: bool,
    handler: ErasedHandler<G>,
}

/// Handlers keyed by message type, run in registration order.
pub struct MessageHandlers<G> {
    slots: Vec<Slot<G>>,
    next_id: u64,
}

impl<G> Default for MessageHandlers<G> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            next_id: 0,
        }
    }
}

impl<G> MessageHandlers<G> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<T, F>(&mut self, mut handler: F) -> HandlerId
    where
        G: 'static,
        T: NetMessage + 'static,
        F: FnMut(&T, &mut HandlerContext<'_, G>) -> HandlerControl + Send + 'static,
    {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.slots.push(Slot {
            id,
            key: T::key(),
            disposed: false,
            handler: Box::new(move |message: &Message, ctx: &mut HandlerContext<'_, G>| match message.get::<T>() {
                Some(typed) => handler(typed, ctx),
                None => HandlerControl::Keep,
            }),
        });
        id
    }

    /// Marks a handler disposed; it is removed at the end of the next dispatch.
    pub fn dispose(&mut self, id: HandlerId) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.id == id) {
            slot.disposed = true;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.disposed).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self, key: MessageKey) -> bool {
        self.slots.iter().any(|slot| slot.key == key && !slot.disposed)
    }

    /// Runs every message of one tick through the matching handlers.
    ///
    /// Each entry pairs a message with its age in frames. Returns how many
    /// messages found no live handler.
    pub fn dispatch(&mut self, messages: &[(Message, f32)], game: &mut G, outbox: &mut Outbox) -> usize {
        let mut unhandled = 0;
        for (message, frames_ago) in messages {
            let key = message.key();
            let mut handled = false;
            for slot in self.slots.iter_mut() {
                if slot.disposed || slot.key != key {
                    continue;
                }
                handled = true;
                let mut ctx = HandlerContext {
                    game: &mut *game,
                    header: message.header,
                    frames_ago: *frames_ago,
                    outbox: &mut *outbox,
                };
                if (slot.handler)(message, &mut ctx) == HandlerControl::Dispose {
                    slot.disposed = true;
                }
            }
            if !handled {
                log::debug!("No handler for {} from {}", message.body.name(), message.header.connection_id);
                unhandled += 1;
            }
        }
        self.slots.retain(|slot| !slot.disposed);
        unhandled
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::net::messages::{PlayerDeletion, PlayerMessage};

    fn chat(connection_id: ConnectionId, text: &str) -> (Message, f32) {
        let body = PlayerMessage {
            player_id: 1,
            text: text.into(),
        };
        (Message::new(connection_id, Instant::now(), body), 0.0)
    }

    #[test]
    fn test_dispatch_routes_by_type() {
        let mut handlers: MessageHandlers<Vec<String>> = MessageHandlers::new();
        handlers.on::<PlayerMessage, _>(|message, ctx| {
            ctx.game.push(message.text.clone());
            ctx.forward(message.clone());
            HandlerControl::Keep
        });
        handlers.on::<PlayerDeletion, _>(|_, _| panic!("wrong type"));

        let mut log = Vec::new();
        let mut outbox = Outbox::default();
        let unhandled = handlers.dispatch(&[chat(4, "hi"), chat(5, "yo")], &mut log, &mut outbox);

        assert_eq!(unhandled, 0);
        assert_eq!(log, vec!["hi", "yo"]);
        let queued = outbox.take();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].0, Target::AllExcept(4));
    }

    #[test]
    fn test_disposed_handler_is_skipped_then_pruned() {
        let mut handlers: MessageHandlers<u32> = MessageHandlers::new();
        handlers.on::<PlayerMessage, _>(|_, ctx| {
            *ctx.game += 1;
            HandlerControl::Dispose
        });
        handlers.on::<PlayerMessage, _>(|_, ctx| {
            *ctx.game += 10;
            HandlerControl::Keep
        });

        let mut count = 0;
        let mut outbox = Outbox::default();
        handlers.dispatch(&[chat(1, "a"), chat(1, "b")], &mut count, &mut outbox);

        assert_eq!(count, 21);
        assert_eq!(handlers.len(), 1);
    }

    #[test]
    fn test_external_dispose() {
        let mut handlers: MessageHandlers<u32> = MessageHandlers::new();
        let id = handlers.on::<PlayerMessage, _>(|_, _| HandlerControl::Keep);
        assert!(handlers.handles(PlayerMessage::key()));
        handlers.dispose(id);
        assert!(!handlers.handles(PlayerMessage::key()));

        let mut outbox = Outbox::default();
        assert_eq!(handlers.dispatch(&[chat(1, "a")], &mut 0, &mut outbox), 1);
        assert!(handlers.is_empty());
    }
}
