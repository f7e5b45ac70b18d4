//! Composable log queries
//!
//! A query is built from independent [`QuerySpec`]s, each narrowing a shared
//! constraint set. Iteration is lazy and pull-based: nothing is read until
//! [`Query::next`] is awaited. Queries are not restartable.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use strand_core::{LogError, ReadOnlySequence, Seq, SeqWrapper};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::Log;

/// One constraint on a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySpec {
    /// Only seqs strictly greater than the given one
    Gt(Seq),
    /// Only seqs greater than or equal to the given one
    Gte(Seq),
    /// Only seqs strictly less than the given one
    Lt(Seq),
    /// Only seqs less than or equal to the given one
    Lte(Seq),
    /// Stop after this many results; negative means unbounded
    Limit(i64),
    /// Iterate from high to low
    Reverse(bool),
    /// Wait for new entries at the tail instead of finishing
    Live(bool),
    /// Yield `SeqWrapper`s instead of bare values
    SeqWrap(bool),
}

pub fn gt(seq: Seq) -> QuerySpec {
    QuerySpec::Gt(seq)
}

pub fn gte(seq: Seq) -> QuerySpec {
    QuerySpec::Gte(seq)
}

pub fn lt(seq: Seq) -> QuerySpec {
    QuerySpec::Lt(seq)
}

pub fn lte(seq: Seq) -> QuerySpec {
    QuerySpec::Lte(seq)
}

pub fn limit(n: i64) -> QuerySpec {
    QuerySpec::Limit(n)
}

pub fn reverse(yes: bool) -> QuerySpec {
    QuerySpec::Reverse(yes)
}

pub fn live(yes: bool) -> QuerySpec {
    QuerySpec::Live(yes)
}

pub fn seq_wrap(yes: bool) -> QuerySpec {
    QuerySpec::SeqWrap(yes)
}

/// Merged constraint set
#[derive(Debug, Clone, Copy)]
struct Constraints {
    lo: Seq,
    hi: Option<Seq>,
    limit: Option<u64>,
    reverse: bool,
    live: bool,
    seq_wrap: bool,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            lo: 0,
            hi: None,
            limit: None,
            reverse: false,
            live: false,
            seq_wrap: false,
        }
    }
}

impl Constraints {
    fn apply(&mut self, spec: QuerySpec) {
        match spec {
            QuerySpec::Gt(seq) => self.raise_lo(seq.saturating_add(1)),
            QuerySpec::Gte(seq) => self.raise_lo(seq),
            QuerySpec::Lt(seq) => self.lower_hi(seq.saturating_sub(1)),
            QuerySpec::Lte(seq) => self.lower_hi(seq),
            QuerySpec::Limit(n) => self.limit = u64::try_from(n).ok(),
            QuerySpec::Reverse(yes) => self.reverse = yes,
            QuerySpec::Live(yes) => self.live = yes,
            QuerySpec::SeqWrap(yes) => self.seq_wrap = yes,
        }
    }

    fn raise_lo(&mut self, lo: Seq) {
        self.lo = self.lo.max(lo);
    }

    fn lower_hi(&mut self, hi: Seq) {
        self.hi = Some(self.hi.map_or(hi, |cur| cur.min(hi)));
    }
}

/// One result of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryItem<T> {
    /// A bare value
    Value(T),
    /// A value paired with its seq
    Wrapped(SeqWrapper<T>),
    /// A tombstoned entry; carries no value
    Nulled(Seq),
}

impl<T> QueryItem<T> {
    /// The seq of the item, if it is known
    pub fn seq(&self) -> Option<Seq> {
        match self {
            Self::Value(_) => None,
            Self::Wrapped(w) => Some(w.seq()),
            Self::Nulled(seq) => Some(*seq),
        }
    }

    pub fn is_nulled(&self) -> bool {
        matches!(self, Self::Nulled(_))
    }

    /// The value, unless the entry was nulled
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            Self::Wrapped(w) => Some(w.into_value()),
            Self::Nulled(_) => None,
        }
    }
}

/// Lazy iteration over a log
pub struct Query<T> {
    log: Arc<dyn Log<T>>,
    tail: ReadOnlySequence,
    constraints: Constraints,
    cursor: Option<Seq>,
    emitted: u64,
    done: bool,
}

impl<T> Query<T>
where
    T: Send + 'static,
{
    /// Merge `specs` and prepare a query over `log`
    ///
    /// Fails with `InvalidQuery` when both reverse and live are requested.
    pub fn new(log: Arc<dyn Log<T>>, specs: &[QuerySpec]) -> Result<Self, LogError> {
        let mut constraints = Constraints::default();
        for spec in specs {
            constraints.apply(*spec);
        }

        if constraints.reverse && constraints.live {
            return Err(LogError::invalid_query(
                "reverse and live cannot be combined",
            ));
        }

        let tail = log.seq();
        Ok(Self {
            log,
            tail,
            constraints,
            cursor: None,
            emitted: 0,
            done: false,
        })
    }

    pub fn is_live(&self) -> bool {
        self.constraints.live
    }

    /// Next seq to read, or `None` once the window is exhausted
    async fn next_seq(&mut self) -> Option<Seq> {
        let c = self.constraints;

        if c.reverse {
            // the starting point is fixed by the tail seen on the first pull
            let seq = *self
                .cursor
                .get_or_insert_with(|| c.hi.map_or(self.tail.tail(), |hi| hi.min(self.tail.tail())));
            return (seq >= c.lo).then_some(seq);
        }

        let seq = *self.cursor.get_or_insert(c.lo);
        if c.hi.is_some_and(|hi| seq > hi) {
            return None;
        }

        if seq > self.tail.tail() {
            if !c.live {
                return None;
            }
            trace!(seq, "Live query waiting for tail");
            self.tail.wait_for_seq(seq).await;
        }
        Some(seq)
    }

    /// Pull the next result
    ///
    /// Returns `None` when the query is exhausted. A live query only ends
    /// at its limit, on an error, or when cancelled.
    pub async fn next(&mut self) -> Option<Result<QueryItem<T>, LogError>> {
        if self.done {
            return None;
        }
        if self.constraints.limit.is_some_and(|limit| self.emitted >= limit) {
            self.done = true;
            return None;
        }

        let Some(seq) = self.next_seq().await else {
            self.done = true;
            return None;
        };

        let item = match self.log.get(seq).await {
            Ok(value) if self.constraints.seq_wrap => QueryItem::Wrapped(SeqWrapper::new(seq, value)),
            Ok(value) => QueryItem::Value(value),
            Err(LogError::Nulled { seq }) => QueryItem::Nulled(seq),
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        self.cursor = Some(if self.constraints.reverse { seq - 1 } else { seq + 1 });
        self.emitted += 1;
        Some(Ok(item))
    }

    /// Like [`Query::next`], but gives up with `Cancelled` once `token` fires
    ///
    /// A cancelled wait releases its registration on the log's tail counter.
    pub async fn next_cancellable(
        &mut self,
        token: &CancellationToken,
    ) -> Option<Result<QueryItem<T>, LogError>> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.done = true;
                Some(Err(LogError::Cancelled))
            }
            item = self.next() => item,
        }
    }

    /// Drain a finite query into a vector
    ///
    /// Never returns for a live query without a limit.
    pub async fn collect_all(mut self) -> Result<Vec<QueryItem<T>>, LogError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Convert into a boxed stream of results
    pub fn into_stream(self) -> BoxStream<'static, Result<QueryItem<T>, LogError>> {
        futures::stream::unfold(self, |mut query| async move {
            query.next().await.map(|item| (item, query))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemLog;
    use std::time::Duration;

    async fn filled(values: &[&str]) -> Arc<MemLog<String>> {
        let log = Arc::new(MemLog::new());
        for v in values {
            log.append(v.to_string()).await.unwrap();
        }
        log
    }

    fn values(items: Vec<QueryItem<String>>) -> Vec<String> {
        items.into_iter().filter_map(QueryItem::into_value).collect()
    }

    #[tokio::test]
    async fn test_full_scan_in_order() {
        let log = filled(&["a", "b", "c"]).await;
        let items = log.query(&[]).unwrap().collect_all().await.unwrap();
        assert_eq!(values(items), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_bounds_narrow_window() {
        let log = filled(&["0", "1", "2", "3", "4", "5"]).await;

        let items = log.clone().query(&[gt(1), lte(4)]).unwrap().collect_all().await.unwrap();
        assert_eq!(values(items), vec!["2", "3", "4"]);

        let items = log.clone().query(&[gte(1), lt(3), gt(1)]).unwrap().collect_all().await.unwrap();
        assert_eq!(values(items), vec!["2"]);

        let items = log.query(&[gt(3), lt(2)]).unwrap().collect_all().await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_limit_and_reverse() {
        let log = filled(&["a", "b", "c", "d"]).await;

        let items = log.clone().query(&[reverse(true), limit(2)]).unwrap().collect_all().await.unwrap();
        assert_eq!(values(items), vec!["d", "c"]);

        let items = log.clone().query(&[reverse(true), lt(2)]).unwrap().collect_all().await.unwrap();
        assert_eq!(values(items), vec!["b", "a"]);

        let items = log.clone().query(&[limit(0)]).unwrap().collect_all().await.unwrap();
        assert!(items.is_empty());

        let items = log.query(&[limit(-1)]).unwrap().collect_all().await.unwrap();
        assert_eq!(items.len(), 4);
    }

    #[tokio::test]
    async fn test_seq_wrap() {
        let log = filled(&["a", "b"]).await;
        let items = log.query(&[seq_wrap(true), gt(0)]).unwrap().collect_all().await.unwrap();
        assert_eq!(
            items,
            vec![QueryItem::Wrapped(SeqWrapper::new(1, "b".to_string()))]
        );
    }

    #[tokio::test]
    async fn test_reverse_live_rejected() {
        let log = filled(&[]).await;
        let err = log.query(&[reverse(true), live(true)]).err().unwrap();
        assert!(matches!(err, LogError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn test_nulled_entries_are_reported() {
        let log = filled(&["a", "b", "c"]).await;
        log.null(1).await.unwrap();

        let items = log.query(&[]).unwrap().collect_all().await.unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1], QueryItem::Nulled(1));
    }

    #[tokio::test]
    async fn test_live_delivers_appends_in_order() {
        let log: Arc<MemLog<String>> = Arc::new(MemLog::new());
        let mut query = log.clone().query(&[live(true), gt(-1), seq_wrap(true)]).unwrap();

        let writer = log.clone();
        let producer = tokio::spawn(async move {
            for v in ["x", "y", "z"] {
                tokio::time::sleep(Duration::from_millis(5)).await;
                writer.append(v.to_string()).await.unwrap();
            }
        });

        let mut seen = Vec::new();
        for _ in 0..3 {
            let item = query.next().await.unwrap().unwrap();
            seen.push((item.seq().unwrap(), item.into_value().unwrap()));
        }
        producer.await.unwrap();

        assert_eq!(
            seen,
            vec![(0, "x".to_string()), (1, "y".to_string()), (2, "z".to_string())]
        );
    }

    #[tokio::test]
    async fn test_cancel_releases_waiter() {
        let log: Arc<MemLog<String>> = Arc::new(MemLog::new());
        let mut query = log.clone().query(&[live(true)]).unwrap();
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let item = query.next_cancellable(&token).await.unwrap();
        assert_eq!(item, Err(LogError::Cancelled));
        assert_eq!(log.seq().waiting(), 0);
        assert!(query.next().await.is_none());
    }

    #[tokio::test]
    async fn test_into_stream() {
        let log = filled(&["a", "b", "c"]).await;
        let stream = log.query(&[gte(1)]).unwrap().into_stream();
        let items: Vec<_> = stream.collect().await;
        let vals: Vec<String> = items
            .into_iter()
            .filter_map(|item| item.ok().and_then(QueryItem::into_value))
            .collect();
        assert_eq!(vals, vec!["b", "c"]);
    }
}
