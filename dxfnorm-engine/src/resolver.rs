//! 块定义之间的引用图与删除顺序求解。
//!
//! 图以显式邻接表表示（块名 → 直接引用的块名），每次清理时重新构建；
//! 遍历状态只存在于单次求解过程中。

use dxfnorm_core::document::Document;
use indexmap::IndexMap;
use tracing::debug;

use crate::errors::EngineError;

const RESERVED_BLOCK_PREFIXES: [&str; 2] = ["*MODEL_SPACE", "*PAPER_SPACE"];

/// 模型空间、图纸空间容器块永远不参与删除。
pub fn is_reserved_block(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    RESERVED_BLOCK_PREFIXES
        .iter()
        .any(|prefix| upper.starts_with(prefix))
}

/// 可删除的块名，保持文档中的定义顺序。
pub fn removable_blocks(document: &Document) -> Vec<String> {
    document
        .block_names()
        .into_iter()
        .filter(|name| !is_reserved_block(name))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unvisited,
    InProgress,
    Done,
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    successors: Vec<String>,
}

/// 限定在候选集合内的块引用图。边 A→B 表示块 A 内含引用 B 的块参照。
#[derive(Debug, Clone, Default)]
pub struct BlockGraph {
    nodes: IndexMap<String, Node>,
}

impl BlockGraph {
    /// 以候选块集合构建引用图，指向集合之外的边被忽略。
    pub fn build(document: &Document, candidates: &[String]) -> Self {
        let mut nodes: IndexMap<String, Node> = IndexMap::with_capacity(candidates.len());
        for name in candidates {
            nodes.entry(name.to_ascii_uppercase()).or_insert_with(|| Node {
                name: name.clone(),
                successors: Vec::new(),
            });
        }

        let keys: Vec<String> = nodes.keys().cloned().collect();
        for key in keys {
            let successors: Vec<String> = match nodes.get(&key).and_then(|node| document.block(&node.name)) {
                Some(block) => block
                    .referenced_blocks()
                    .into_iter()
                    .map(str::to_ascii_uppercase)
                    .filter(|target| nodes.contains_key(target))
                    .collect(),
                None => Vec::new(),
            };
            if let Some(node) = nodes.get_mut(&key) {
                node.successors = successors;
            }
        }

        Self { nodes }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 直接被 `name` 引用的候选块。
    pub fn successors(&self, name: &str) -> Vec<&str> {
        self.nodes
            .get(&name.to_ascii_uppercase())
            .map(|node| {
                node.successors
                    .iter()
                    .filter_map(|key| self.nodes.get(key).map(|target| target.name.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 深度优先求解删除顺序：引用者在前，被引用者在后。
    ///
    /// 按候选集合的逆序出发并反转完成序，因此互不相关的块保持原始顺序。
    /// 图中存在环时返回 `CyclicDependency`。
    pub fn deletion_order(&self) -> Result<Vec<String>, EngineError> {
        let mut states = vec![VisitState::Unvisited; self.nodes.len()];
        let mut finished = Vec::with_capacity(self.nodes.len());
        for index in (0..self.nodes.len()).rev() {
            if states[index] == VisitState::Unvisited {
                self.visit(index, &mut states, &mut finished)?;
            }
        }
        let order: Vec<String> = finished
            .into_iter()
            .rev()
            .filter_map(|index| self.nodes.get_index(index).map(|(_, node)| node.name.clone()))
            .collect();
        debug!(blocks = order.len(), "块删除顺序求解完成");
        Ok(order)
    }

    fn visit(
        &self,
        index: usize,
        states: &mut [VisitState],
        finished: &mut Vec<usize>,
    ) -> Result<(), EngineError> {
        states[index] = VisitState::InProgress;
        let Some((_, node)) = self.nodes.get_index(index) else {
            return Ok(());
        };
        for key in &node.successors {
            let Some(next) = self.nodes.get_index_of(key) else {
                continue;
            };
            match states[next] {
                VisitState::InProgress => {
                    return Err(EngineError::CyclicDependency(node.name.clone()));
                }
                VisitState::Unvisited => self.visit(next, states, finished)?,
                VisitState::Done => {}
            }
        }
        states[index] = VisitState::Done;
        finished.push(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use dxfnorm_core::document::{BlockDefinition, BlockReference, Entity, EntityAttributes};
    use dxfnorm_core::geometry::{Point2, Vector2};

    use super::*;

    fn reference(target: &str) -> Entity {
        Entity::BlockReference(BlockReference {
            name: target.to_string(),
            insert: Point2::new(0.0, 0.0),
            scale: Vector2::new(1.0, 1.0),
            rotation: 0.0,
            attributes: Vec::new(),
            attrs: EntityAttributes::on_layer("0"),
        })
    }

    fn block(name: &str, targets: &[&str]) -> BlockDefinition {
        let mut block = BlockDefinition::new(name);
        block.entities.extend(targets.iter().map(|target| reference(target)));
        block
    }

    fn names(order: &[String]) -> Vec<&str> {
        order.iter().map(String::as_str).collect()
    }

    #[test]
    fn reserved_prefixes_are_case_insensitive() {
        assert!(is_reserved_block("*Model_Space"));
        assert!(is_reserved_block("*paper_space0"));
        assert!(!is_reserved_block("MODEL_SPACE"));
        assert!(!is_reserved_block("*U12"));
    }

    #[test]
    fn chain_is_deleted_outer_first() {
        let mut doc = Document::new();
        doc.add_block_definition(block("C", &[]));
        doc.add_block_definition(block("A", &["B"]));
        doc.add_block_definition(block("B", &["C"]));
        doc.add_block_definition(block("*Model_Space", &["A"]));

        let removable = removable_blocks(&doc);
        assert_eq!(names(&removable), vec!["C", "A", "B"]);

        let graph = BlockGraph::build(&doc, &removable);
        assert_eq!(graph.successors("a"), vec!["B"]);
        let order = graph.deletion_order().expect("acyclic graph");
        assert_eq!(names(&order), vec!["A", "B", "C"]);
    }

    #[test]
    fn every_edge_points_forward_in_order() {
        let mut doc = Document::new();
        doc.add_block_definition(block("LEAF", &[]));
        doc.add_block_definition(block("MID1", &["LEAF"]));
        doc.add_block_definition(block("MID2", &["LEAF", "MID1"]));
        doc.add_block_definition(block("TOP", &["MID2", "EXTERNAL"]));
        doc.add_block_definition(block("LONE", &[]));

        let removable = removable_blocks(&doc);
        let graph = BlockGraph::build(&doc, &removable);
        let order = graph.deletion_order().unwrap();
        assert_eq!(order.len(), removable.len());

        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        for source in &removable {
            for target in graph.successors(source) {
                assert!(position(source) < position(target), "{source} -> {target}");
            }
        }
    }

    #[test]
    fn isolated_blocks_keep_insertion_order() {
        let mut doc = Document::new();
        for name in ["X", "Y", "Z"] {
            doc.add_block_definition(block(name, &[]));
        }
        let removable = removable_blocks(&doc);
        let order = BlockGraph::build(&doc, &removable).deletion_order().unwrap();
        assert_eq!(names(&order), vec!["X", "Y", "Z"]);
    }

    #[test]
    fn mutual_reference_is_a_cycle() {
        let mut doc = Document::new();
        doc.add_block_definition(block("A", &["B"]));
        doc.add_block_definition(block("B", &["A"]));
        let removable = removable_blocks(&doc);
        let err = BlockGraph::build(&doc, &removable)
            .deletion_order()
            .unwrap_err();
        assert!(matches!(err, EngineError::CyclicDependency(_)));
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let mut doc = Document::new();
        doc.add_block_definition(block("SELF", &["self"]));
        let removable = removable_blocks(&doc);
        assert!(BlockGraph::build(&doc, &removable).deletion_order().is_err());
    }
}
