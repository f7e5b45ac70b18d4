//! Boolean subset queries over multilog bitmaps
//!
//! A [`SubsetOperation`] is a tree of `author`/`type` leaves combined with
//! `and`/`or`. The [`SubsetPlanner`] evaluates it against the by-author and
//! by-type multilogs into a single bitmap of log seqs.
//!
//! JSON form:
//!
//! ```json
//! {"op":"and","args":[{"op":"author","feed":"@alice"},{"op":"type","string":"post"}]}
//! ```

use std::sync::Arc;

use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};
use strand_core::{Addr, LogError, Seq, SeqWrapper};
use tracing::{debug, instrument};

use crate::error::StorageError;
use crate::log::Log;
use crate::multilog::MultiLog;

/// Validation limits applied before evaluation
#[derive(Debug, Clone)]
pub struct SubsetLimits {
    /// Largest accepted JSON query
    pub max_query_bytes: usize,
    /// Deepest accepted nesting of `and`/`or`
    pub max_depth: usize,
}

impl Default for SubsetLimits {
    fn default() -> Self {
        Self {
            max_query_bytes: 4 * 1024,
            max_depth: 32,
        }
    }
}

/// One node of a subset query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum SubsetOperation {
    And {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<SubsetOperation>,
    },
    Or {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<SubsetOperation>,
    },
    /// Messages of one type
    Type {
        #[serde(default)]
        string: String,
    },
    /// Messages by one author
    Author {
        #[serde(default)]
        feed: String,
    },
}

impl SubsetOperation {
    pub fn and(args: Vec<SubsetOperation>) -> Self {
        Self::And { args }
    }

    pub fn or(args: Vec<SubsetOperation>) -> Self {
        Self::Or { args }
    }

    pub fn by_type(value: impl Into<String>) -> Self {
        Self::Type {
            string: value.into(),
        }
    }

    pub fn by_author(feed: impl Into<String>) -> Self {
        Self::Author { feed: feed.into() }
    }

    /// Parse and validate the JSON form
    pub fn parse(json: &str, limits: &SubsetLimits) -> Result<Self, StorageError> {
        if json.len() > limits.max_query_bytes {
            return Err(StorageError::invalid_subset(format!(
                "query is too long ({} bytes)",
                json.len()
            )));
        }
        let op: Self = serde_json::from_str(json)
            .map_err(|e| StorageError::invalid_subset(format!("unmarshaling failed: {e}")))?;
        op.validate(limits)?;
        Ok(op)
    }

    /// Check the structure without touching any bitmap
    pub fn validate(&self, limits: &SubsetLimits) -> Result<(), StorageError> {
        self.validate_at(0, limits)
    }

    fn validate_at(&self, depth: usize, limits: &SubsetLimits) -> Result<(), StorageError> {
        if depth > limits.max_depth {
            return Err(StorageError::invalid_subset(format!(
                "query nested deeper than {}",
                limits.max_depth
            )));
        }
        match self {
            Self::And { args } | Self::Or { args } => {
                args.iter().try_for_each(|arg| arg.validate_at(depth + 1, limits))
            }
            Self::Author { feed } if feed.is_empty() => {
                Err(StorageError::invalid_subset("author can't be empty"))
            }
            Self::Author { .. } | Self::Type { .. } => Ok(()),
        }
    }

    pub fn to_json(&self) -> Result<String, StorageError> {
        serde_json::to_string(self).map_err(|e| StorageError::serialization(e.to_string()))
    }
}

/// How matched messages are returned
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsetOptions {
    /// Newest first
    #[serde(default)]
    pub descending: bool,
    /// Stop after this many messages
    #[serde(default)]
    pub page_limit: Option<usize>,
}

/// Evaluates subset queries against the by-author and by-type multilogs
pub struct SubsetPlanner {
    by_author: Arc<dyn MultiLog>,
    by_type: Arc<dyn MultiLog>,
    limits: SubsetLimits,
}

impl SubsetPlanner {
    pub fn new(by_author: Arc<dyn MultiLog>, by_type: Arc<dyn MultiLog>) -> Self {
        Self {
            by_author,
            by_type,
            limits: SubsetLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: SubsetLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &SubsetLimits {
        &self.limits
    }

    /// Seqs matching `op`
    ///
    /// `and`/`or` without arguments match nothing and yield `None`. The
    /// query is validated in full before any bitmap is loaded.
    ///
    /// Nested inside another `and`/`or`, an empty `and`/`or` counts as the
    /// empty set and the fold carries on, so `or(and(), author)` still
    /// matches the author's messages.
    #[instrument(skip_all)]
    pub fn query_subset_bitmap(
        &self,
        op: &SubsetOperation,
    ) -> Result<Option<RoaringTreemap>, StorageError> {
        op.validate(&self.limits)?;
        let result = self.eval(op)?;
        debug!(matches = result.as_ref().map_or(0, RoaringTreemap::len), "Evaluated subset");
        Ok(result)
    }

    fn eval(&self, op: &SubsetOperation) -> Result<Option<RoaringTreemap>, StorageError> {
        match op {
            SubsetOperation::Author { feed } => Ok(Some(
                self.by_author.load_bitmap(&Addr::from(feed.as_str()))?,
            )),
            SubsetOperation::Type { string } => Ok(Some(
                self.by_type.load_bitmap(&Addr::from(string.as_str()))?,
            )),
            SubsetOperation::And { args } => self.combine("and", args, |acc, next| *acc &= next),
            SubsetOperation::Or { args } => self.combine("or", args, |acc, next| *acc |= next),
        }
    }

    /// Fold `args` into the first one; a nested empty combination counts as
    /// the empty set
    fn combine(
        &self,
        op: &'static str,
        args: &[SubsetOperation],
        fold: impl Fn(&mut RoaringTreemap, &RoaringTreemap),
    ) -> Result<Option<RoaringTreemap>, StorageError> {
        let Some((first, rest)) = args.split_first() else {
            return Ok(None);
        };

        let mut acc = self.eval_arg(op, 0, first)?.unwrap_or_default();
        for (i, arg) in rest.iter().enumerate() {
            let next = self.eval_arg(op, i + 1, arg)?.unwrap_or_default();
            fold(&mut acc, &next);
        }
        Ok(Some(acc))
    }

    fn eval_arg(
        &self,
        op: &'static str,
        position: usize,
        arg: &SubsetOperation,
    ) -> Result<Option<RoaringTreemap>, StorageError> {
        self.eval(arg).map_err(|e| StorageError::Subset {
            op,
            position,
            source: Box::new(e),
        })
    }

    /// Resolve the matches of `op` to log values
    ///
    /// Nulled entries are skipped and do not count towards the page limit.
    pub async fn query_subset_messages<T>(
        &self,
        log: &dyn Log<T>,
        op: &SubsetOperation,
        opts: &SubsetOptions,
    ) -> Result<Vec<SeqWrapper<T>>, StorageError>
    where
        T: Send + 'static,
    {
        let Some(bitmap) = self.query_subset_bitmap(op)? else {
            return Ok(Vec::new());
        };

        let mut seqs: Vec<u64> = bitmap.iter().collect();
        if opts.descending {
            seqs.reverse();
        }

        let limit = opts.page_limit.unwrap_or(usize::MAX);
        let mut messages = Vec::new();
        for seq in seqs {
            if messages.len() >= limit {
                break;
            }
            let seq = seq as Seq;
            match log.get(seq).await {
                Ok(value) => messages.push(SeqWrapper::new(seq, value)),
                Err(LogError::Nulled { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(messages)
    }
}
