// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Hook Chains
//!
//! A hook wraps the next stage of the consume or publish path and returns a
//! new stage. Chains are composed once, when a consumer or publisher is
//! created: the first registered hook ends up outermost, so it sees the call
//! first and the result last.

use crate::{handler::Consume, publisher::Publish};
use std::sync::Arc;

/// Middleware around delivery dispatch.
pub trait ConsumeHook: Send + Sync {
    fn wrap_consume(&self, next: Arc<dyn Consume>) -> Arc<dyn Consume>;
}

/// Middleware around message submission.
pub trait PublishHook: Send + Sync {
    fn wrap_publish(&self, next: Arc<dyn Publish>) -> Arc<dyn Publish>;
}

pub(crate) fn consume_chain(
    hooks: &[Arc<dyn ConsumeHook>],
    terminal: Arc<dyn Consume>,
) -> Arc<dyn Consume> {
    hooks
        .iter()
        .rev()
        .fold(terminal, |next, hook| hook.wrap_consume(next))
}

pub(crate) fn publish_chain(
    hooks: &[Arc<dyn PublishHook>],
    terminal: Arc<dyn Publish>,
) -> Arc<dyn Publish> {
    hooks
        .iter()
        .rev()
        .fold(terminal, |next, hook| hook.wrap_publish(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockAcknowledger,
        delivery::{tests::new_delivery, Action, Delivery},
        errors::AmqpError,
        publisher::PublishRequest,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;

    type Trace = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        trace: Trace,
    }

    struct Recorded {
        name: &'static str,
        trace: Trace,
        next: Option<Arc<dyn Consume>>,
        next_publish: Option<Arc<dyn Publish>>,
    }

    impl Recorded {
        fn push(&self, suffix: &str) {
            self.trace.lock().push(format!("{}{}", self.name, suffix));
        }
    }

    #[async_trait]
    impl Consume for Recorded {
        async fn serve(&self, delivery: &mut Delivery) -> Action {
            self.push("-in");
            let action = match &self.next {
                Some(next) => next.serve(delivery).await,
                None => Action::Ack,
            };
            self.push("-out");
            action
        }
    }

    #[async_trait]
    impl Publish for Recorded {
        async fn publish(&self, request: &mut PublishRequest) -> Result<(), AmqpError> {
            self.push("-in");
            let result = match &self.next_publish {
                Some(next) => next.publish(request).await,
                None => Ok(()),
            };
            self.push("-out");
            result
        }
    }

    impl ConsumeHook for Recorder {
        fn wrap_consume(&self, next: Arc<dyn Consume>) -> Arc<dyn Consume> {
            Arc::new(Recorded {
                name: self.name,
                trace: self.trace.clone(),
                next: Some(next),
                next_publish: None,
            })
        }
    }

    impl PublishHook for Recorder {
        fn wrap_publish(&self, next: Arc<dyn Publish>) -> Arc<dyn Publish> {
            Arc::new(Recorded {
                name: self.name,
                trace: self.trace.clone(),
                next: None,
                next_publish: Some(next),
            })
        }
    }

    struct Terminal(Trace);

    #[async_trait]
    impl Consume for Terminal {
        async fn serve(&self, _: &mut Delivery) -> Action {
            self.0.lock().push("t".to_owned());
            Action::Nack
        }
    }

    #[async_trait]
    impl Publish for Terminal {
        async fn publish(&self, _: &mut PublishRequest) -> Result<(), AmqpError> {
            self.0.lock().push("t".to_owned());
            Ok(())
        }
    }

    fn hooks(trace: &Trace) -> (Arc<Recorder>, Arc<Recorder>) {
        let a = Arc::new(Recorder {
            name: "a",
            trace: trace.clone(),
        });
        let b = Arc::new(Recorder {
            name: "b",
            trace: trace.clone(),
        });
        (a, b)
    }

    fn expected() -> Vec<String> {
        ["a-in", "b-in", "t", "b-out", "a-out"]
            .map(String::from)
            .to_vec()
    }

    #[tokio::test]
    async fn first_consume_hook_is_outermost() {
        let trace = Trace::default();
        let (a, b) = hooks(&trace);

        let hooks: [Arc<dyn ConsumeHook>; 2] = [a, b];
        let chain = consume_chain(&hooks, Arc::new(Terminal(trace.clone())));
        let mut delivery = new_delivery(Arc::new(MockAcknowledger::new()), 1);

        assert_eq!(chain.serve(&mut delivery).await, Action::Nack);
        assert_eq!(*trace.lock(), expected());
    }

    #[tokio::test]
    async fn first_publish_hook_is_outermost() {
        let trace = Trace::default();
        let (a, b) = hooks(&trace);

        let hooks: [Arc<dyn PublishHook>; 2] = [a, b];
        let chain = publish_chain(&hooks, Arc::new(Terminal(trace.clone())));
        let mut request = PublishRequest::new("amq.direct", "key", vec![]);

        assert!(chain.publish(&mut request).await.is_ok());
        assert_eq!(*trace.lock(), expected());
    }

    #[tokio::test]
    async fn empty_chain_is_the_terminal() {
        let trace = Trace::default();

        let chain = consume_chain(&[], Arc::new(Terminal(trace.clone())));
        let mut delivery = new_delivery(Arc::new(MockAcknowledger::new()), 1);
        chain.serve(&mut delivery).await;

        assert_eq!(*trace.lock(), vec!["t".to_owned()]);
    }
}
