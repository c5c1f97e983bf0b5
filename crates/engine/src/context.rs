//! Per-run transaction context
//!
//! A fresh `TransactionContext` is built for every `Transaction::execute`
//! call and handed to the master step. Steps may turn it into a context of a
//! richer shape with [`TransactionContext::map`] or
//! [`TransactionContext::with`]; run id, name and span carry over.

use std::fmt;
use std::sync::Arc;
use tracing::Span;
use uuid::Uuid;

/// Caller parameters plus run metadata
pub struct TransactionContext<P> {
    run_id: Uuid,
    name: Arc<str>,
    params: P,
    span: Span,
}

impl<P> TransactionContext<P> {
    /// Create a context for one run
    pub fn new(run_id: Uuid, name: Arc<str>, params: P, span: Span) -> Self {
        Self {
            run_id,
            name,
            params,
            span,
        }
    }

    /// Unique id of this run
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Name of the transaction definition
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tracing span scoped to this run
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Borrow the parameters
    pub fn params(&self) -> &P {
        &self.params
    }

    /// Mutably borrow the parameters
    pub fn params_mut(&mut self) -> &mut P {
        &mut self.params
    }

    /// Take the parameters, dropping the run metadata
    pub fn into_params(self) -> P {
        self.params
    }

    /// Transform the parameters, keeping the run metadata
    pub fn map<Q, F>(self, f: F) -> TransactionContext<Q>
    where
        F: FnOnce(P) -> Q,
    {
        TransactionContext {
            run_id: self.run_id,
            name: self.name,
            params: f(self.params),
            span: self.span,
        }
    }

    /// Replace the parameters, keeping the run metadata
    pub fn with<Q>(self, params: Q) -> TransactionContext<Q> {
        self.map(|_| params)
    }
}

impl<P: fmt::Debug> fmt::Debug for TransactionContext<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("run_id", &self.run_id)
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_keeps_run_metadata() {
        let run_id = Uuid::new_v4();
        let ctx = TransactionContext::new(run_id, Arc::from("transfer"), 5u32, Span::none());
        let ctx = ctx.map(|n| (n, "enriched"));
        assert_eq!(ctx.run_id(), run_id);
        assert_eq!(ctx.name(), "transfer");
        assert_eq!(*ctx.params(), (5, "enriched"));

        let ctx = ctx.with(vec![1, 2]);
        assert_eq!(ctx.into_params(), vec![1, 2]);
    }
}
