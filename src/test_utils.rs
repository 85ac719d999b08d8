use crate::config::Config;
use crate::model::GraphModel;
use crate::query::{FeatureRecord, NodeInit, TrainingQuery};

pub(crate) fn relation(a: usize, b: usize, rel: &str) -> FeatureRecord {
    FeatureRecord::Relation {
        a,
        b,
        rel: rel.to_string(),
    }
}

pub(crate) fn scope(nodes: &[usize]) -> FeatureRecord {
    FeatureRecord::Scope {
        nodes: nodes.to_vec(),
    }
}

pub(crate) fn group(nodes: &[usize]) -> FeatureRecord {
    FeatureRecord::Group {
        nodes: nodes.to_vec(),
    }
}

pub(crate) fn init(node: usize, label: &str, given: bool) -> NodeInit {
    NodeInit {
        node,
        label: label.to_string(),
        given,
    }
}

/// The five-node reference labeling shared by the inference scenarios.
pub(crate) fn standard_assignment() -> Vec<NodeInit> {
    vec![
        init(0, "base", false),
        init(1, "AST_Node", true),
        init(2, "props", false),
        init(3, "split", true),
        init(4, "step", true),
    ]
}

/// The same nodes with placeholder labels at the inferred positions.
pub(crate) fn standard_infer_inits() -> Vec<NodeInit> {
    vec![
        init(0, "a", false),
        init(1, "AST_Node", true),
        init(2, "b", false),
        init(3, "split", true),
        init(4, "step", true),
    ]
}

pub(crate) fn prepared_model(config: Config, dataset: &[TrainingQuery]) -> GraphModel {
    let mut model = GraphModel::with_config(config);
    for query in dataset {
        model.add_query(query);
    }
    model.prepare().unwrap();
    model
}
