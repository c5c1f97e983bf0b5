//! Transaction steps
//!
//! A step is one unit of transaction logic. It declares up front which
//! segments it reads and writes, so the monitor can lock all of them before
//! the first step runs, and then executes on the transaction's connection.
//!
//! Steps compose with [`Step::then`]: the output of the first step is the
//! input of the second and the declared segments are the union of both.
//!
//! ```ignore
//! let load = step_fn(vec![Segment::new("accounts")], vec![], |conn, _monitor, ctx| {
//!     Box::pin(async move {
//!         let rows = conn.execute_query("SELECT balance FROM accounts").await?;
//!         Ok(ctx.with(rows))
//!     })
//! });
//! let master = load.then(apply_interest);
//! ```

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use tessera_concurrency::TransactionMonitor;
use tessera_connection::Connection;
use tessera_core::{Result, Segment};

/// One unit of transaction logic
#[async_trait]
pub trait Step<C: Send + 'static>: Send + Sync {
    /// Value produced for the next step, or returned to the caller
    type Output: Send + 'static;

    /// Segments this step only reads
    fn read_segments(&self) -> Vec<Segment>;

    /// Segments this step may write
    fn write_segments(&self) -> Vec<Segment>;

    /// Run the step inside the open transaction
    async fn execute(
        &self,
        conn: &mut Connection,
        monitor: &mut TransactionMonitor,
        input: C,
    ) -> Result<Self::Output>;

    /// Run `next` after this step, feeding it this step's output
    fn then<B>(self, next: B) -> Then<Self, B>
    where
        Self: Sized,
        B: Step<Self::Output>,
    {
        Then {
            first: self,
            second: next,
        }
    }
}

fn union(a: Vec<Segment>, b: Vec<Segment>) -> Vec<Segment> {
    let mut seen = HashSet::new();
    a.into_iter()
        .chain(b)
        .filter(|segment| seen.insert(segment.id()))
        .collect()
}

/// Sequential composition of two steps
pub struct Then<A, B> {
    first: A,
    second: B,
}

#[async_trait]
impl<C, A, B> Step<C> for Then<A, B>
where
    C: Send + 'static,
    A: Step<C>,
    B: Step<A::Output>,
{
    type Output = B::Output;

    fn read_segments(&self) -> Vec<Segment> {
        union(self.first.read_segments(), self.second.read_segments())
    }

    fn write_segments(&self) -> Vec<Segment> {
        union(self.first.write_segments(), self.second.write_segments())
    }

    async fn execute(
        &self,
        conn: &mut Connection,
        monitor: &mut TransactionMonitor,
        input: C,
    ) -> Result<B::Output> {
        let intermediate = self.first.execute(conn, monitor, input).await?;
        self.second.execute(conn, monitor, intermediate).await
    }
}

/// Step backed by a closure
pub struct StepFn<F, C, O> {
    read: Vec<Segment>,
    write: Vec<Segment>,
    f: F,
    _types: PhantomData<fn(C) -> O>,
}

/// Build a step from declared segments and a closure
///
/// The closure returns a boxed future borrowing the connection and monitor,
/// usually written as `|conn, monitor, input| Box::pin(async move { .. })`.
pub fn step_fn<C, O, F>(read: Vec<Segment>, write: Vec<Segment>, f: F) -> StepFn<F, C, O>
where
    C: Send + 'static,
    O: Send + 'static,
    F: for<'a> Fn(&'a mut Connection, &'a mut TransactionMonitor, C) -> BoxFuture<'a, Result<O>>
        + Send
        + Sync,
{
    StepFn {
        read,
        write,
        f,
        _types: PhantomData,
    }
}

#[async_trait]
impl<C, O, F> Step<C> for StepFn<F, C, O>
where
    C: Send + 'static,
    O: Send + 'static,
    F: for<'a> Fn(&'a mut Connection, &'a mut TransactionMonitor, C) -> BoxFuture<'a, Result<O>>
        + Send
        + Sync,
{
    type Output = O;

    fn read_segments(&self) -> Vec<Segment> {
        self.read.clone()
    }

    fn write_segments(&self) -> Vec<Segment> {
        self.write.clone()
    }

    async fn execute(
        &self,
        conn: &mut Connection,
        monitor: &mut TransactionMonitor,
        input: C,
    ) -> Result<O> {
        (self.f)(conn, monitor, input).await
    }
}

impl<F, C, O> fmt::Debug for StepFn<F, C, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepFn")
            .field("read", &self.read)
            .field("write", &self.write)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessera_concurrency::SegmentMonitor;
    use tessera_connection::mock::MockDriver;
    use tessera_connection::{ConnectionProvider, PoolOptions, PoolProvider};
    use tessera_core::{EndTransaction, TransactionMode};

    fn add(n: u32, write: &str) -> impl Step<u32, Output = u32> {
        step_fn(
            vec![Segment::new("shared")],
            vec![Segment::new(write)],
            move |conn, _monitor, input: u32| {
                Box::pin(async move {
                    conn.execute_statement("DO 1").await?;
                    Ok(input + n)
                })
            },
        )
    }

    #[test]
    fn test_then_unions_segments() {
        let chained = add(1, "a").then(add(2, "b")).then(add(3, "a"));
        assert_eq!(chained.read_segments(), vec![Segment::new("shared")]);
        assert_eq!(
            chained.write_segments(),
            vec![Segment::new("a"), Segment::new("b")]
        );
    }

    #[tokio::test]
    async fn test_then_feeds_output_forward() {
        let driver = MockDriver::new("5.7.34");
        let pool = PoolProvider::connect(Arc::new(driver.clone()), PoolOptions::default())
            .await
            .unwrap();
        let monitor = SegmentMonitor::in_memory();

        let step = add(1, "a").then(add(10, "b"));
        let mut conn = pool.get_connection().await.unwrap();
        conn.begin_transaction(TransactionMode::ReadWrite).await.unwrap();
        let mut tm = monitor
            .monitor_transaction(&mut conn, &step.read_segments(), &step.write_segments())
            .await
            .unwrap();

        let out = step.execute(&mut conn, &mut tm, 100).await.unwrap();
        assert_eq!(out, 111);
        assert_eq!(driver.count("DO 1"), 2);

        conn.end_transaction(EndTransaction::Commit).await.unwrap();
        tm.release();
        conn.release().unwrap();
    }
}
