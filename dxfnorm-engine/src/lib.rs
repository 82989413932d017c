pub mod clouds;
pub mod explode;
pub mod layers;
pub mod merge;
pub mod pipeline;
pub mod purge;
pub mod resolver;

pub mod errors {
    use dxfnorm_core::errors::{DocumentError, RemapError};
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum EngineError {
        #[error("block reference graph contains a cycle through {0:?}")]
        CyclicDependency(String),
        #[error("explode did not finish after {passes} passes, {remaining} references left")]
        ExplodeLimitExceeded { passes: usize, remaining: usize },
        #[error("cloud segment length must be a positive finite number, got {0}")]
        InvalidSegmentLength(f64),
        #[error(transparent)]
        Remap(#[from] RemapError),
        #[error(transparent)]
        Document(#[from] DocumentError),
    }
}

pub mod report {
    /// 单个对象（块、实体、线型等）的处理结果。
    #[derive(Debug, Clone, PartialEq)]
    pub enum Outcome {
        Applied,
        Skipped { reason: String },
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct ItemOutcome {
        pub subject: String,
        pub outcome: Outcome,
    }

    /// 一轮“逐个尝试、失败跳过”处理的结果汇总，按处理顺序记录。
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct PassReport {
        items: Vec<ItemOutcome>,
    }

    impl PassReport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn record_applied(&mut self, subject: impl Into<String>) {
            self.items.push(ItemOutcome {
                subject: subject.into(),
                outcome: Outcome::Applied,
            });
        }

        pub fn record_skipped(&mut self, subject: impl Into<String>, reason: impl ToString) {
            self.items.push(ItemOutcome {
                subject: subject.into(),
                outcome: Outcome::Skipped {
                    reason: reason.to_string(),
                },
            });
        }

        #[inline]
        pub fn items(&self) -> &[ItemOutcome] {
            &self.items
        }

        pub fn applied(&self) -> impl Iterator<Item = &str> {
            self.items
                .iter()
                .filter(|item| item.outcome == Outcome::Applied)
                .map(|item| item.subject.as_str())
        }

        pub fn skipped(&self) -> impl Iterator<Item = (&str, &str)> {
            self.items.iter().filter_map(|item| match &item.outcome {
                Outcome::Skipped { reason } => Some((item.subject.as_str(), reason.as_str())),
                Outcome::Applied => None,
            })
        }

        #[inline]
        pub fn applied_count(&self) -> usize {
            self.applied().count()
        }

        #[inline]
        pub fn skipped_count(&self) -> usize {
            self.items.len() - self.applied_count()
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.items.is_empty()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn pass_report_keeps_processing_order() {
            let mut report = PassReport::new();
            report.record_applied("A");
            report.record_skipped("B", "still referenced");
            report.record_applied("C");

            assert_eq!(report.applied().collect::<Vec<_>>(), vec!["A", "C"]);
            assert_eq!(
                report.skipped().collect::<Vec<_>>(),
                vec![("B", "still referenced")]
            );
            assert_eq!(report.applied_count(), 2);
            assert_eq!(report.skipped_count(), 1);
            assert_eq!(report.items()[1].subject, "B");
        }
    }
}
