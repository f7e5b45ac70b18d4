//! Read-only log of pointers into another log

use std::sync::Arc;

use async_trait::async_trait;
use strand_core::{LogError, ReadOnlySequence, Seq};

use super::{Log, Query, QuerySpec};

/// Dereferences every entry of `pointers` against `target`
///
/// The tail follows the pointer log, so live queries over a sublog of seqs
/// yield the referenced values as they are added.
pub struct IndirectLog<T> {
    pointers: Arc<dyn Log<Seq>>,
    target: Arc<dyn Log<T>>,
}

impl<T> IndirectLog<T>
where
    T: Send + 'static,
{
    pub fn new(pointers: Arc<dyn Log<Seq>>, target: Arc<dyn Log<T>>) -> Self {
        Self { pointers, target }
    }
}

#[async_trait]
impl<T> Log<T> for IndirectLog<T>
where
    T: Send + 'static,
{
    async fn append(&self, _value: T) -> Result<Seq, LogError> {
        Err(LogError::ReadOnly("indirect log"))
    }

    async fn get(&self, seq: Seq) -> Result<T, LogError> {
        let target_seq = self.pointers.get(seq).await?;
        match self.target.get(target_seq).await {
            // report the position within this view
            Err(LogError::Nulled { .. }) => Err(LogError::Nulled { seq }),
            other => other,
        }
    }

    fn seq(&self) -> ReadOnlySequence {
        self.pointers.seq()
    }

    fn query(self: Arc<Self>, specs: &[QuerySpec]) -> Result<Query<T>, LogError> {
        Query::new(self, specs)
    }

    async fn null(&self, _seq: Seq) -> Result<(), LogError> {
        Err(LogError::ReadOnly("indirect log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{MemLog, QueryItem, reverse};

    async fn setup() -> (Arc<MemLog<Seq>>, Arc<MemLog<String>>, Arc<IndirectLog<String>>) {
        let target = Arc::new(MemLog::new());
        for v in ["a", "b", "c", "d"] {
            target.append(v.to_string()).await.unwrap();
        }
        let pointers = Arc::new(MemLog::new());
        pointers.append(3).await.unwrap();
        pointers.append(1).await.unwrap();

        let view = Arc::new(IndirectLog::new(pointers.clone(), target.clone()));
        (pointers, target, view)
    }

    #[tokio::test]
    async fn test_dereferences_pointers() {
        let (_, _, view) = setup().await;
        assert_eq!(view.get(0).await.unwrap(), "d");
        assert_eq!(view.get(1).await.unwrap(), "b");
        assert_eq!(view.seq().tail(), 1);

        let items = view.query(&[reverse(true)]).unwrap().collect_all().await.unwrap();
        let values: Vec<String> = items.into_iter().filter_map(QueryItem::into_value).collect();
        assert_eq!(values, vec!["b", "d"]);
    }

    #[tokio::test]
    async fn test_mutation_is_read_only() {
        let (_, _, view) = setup().await;
        assert!(matches!(view.append("x".into()).await, Err(LogError::ReadOnly(_))));
        assert!(matches!(view.null(0).await, Err(LogError::ReadOnly(_))));
    }

    #[tokio::test]
    async fn test_nulled_target_reports_view_seq() {
        let (_, target, view) = setup().await;
        target.null(1).await.unwrap();
        assert_eq!(view.get(1).await, Err(LogError::Nulled { seq: 1 }));
    }
}
