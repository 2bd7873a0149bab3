use std::collections::BTreeMap;

use xgraph::graph::{CompilerOutput, GraphSerdeError, RuntimeArtifact, GRAPH_FORMAT_VERSION};
use xgraph::partition::{Partitioner, TaggedPartitioner};
use xgraph::{
    build, AttrValue, Attrs, Graph, GraphBuilder, GraphError, Node, Shapes, Tensor, TensorShape,
};

fn annotated_graph() -> Graph {
    let mut compiled = CompilerOutput::new();
    compiled.insert(
        "xp0",
        RuntimeArtifact {
            in_map: BTreeMap::from([("data".to_string(), "xinput0".to_string())]),
            out_map: BTreeMap::from([("relu".to_string(), "xoutput0".to_string())]),
        },
    );
    GraphBuilder::new("annotated")
        .node(Node::new("data", "Input", Shapes::tensor([-1, 3, 4, 4])))
        .node(
            Node::new("conv", "Convolution", Shapes::tensor([-1, 2, 4, 4]))
                .with_bottoms(["data"])
                .with_attr("strides", vec![1i64, 1])
                .with_attr("padding", vec![1i64, 1])
                .with_attr("scale", 0.5)
                .with_attr("data_layout", "NCHW")
                .with_data(vec![
                    Tensor::ones(&[2, 3, 3, 3]),
                    Tensor::from_vec(&[2], vec![0.25, -0.25]).unwrap(),
                ])
                .in_partition("xp0", "dpu"),
        )
        .node(
            Node::new("relu", "ReLU", Shapes::tensor([-1, 2, 4, 4]))
                .with_bottoms(["conv"])
                .in_partition("xp0", "dpu"),
        )
        .node(
            Node::new("split", "Split", Shapes::Tuple(vec![
                TensorShape::new([-1, 1, 4, 4]),
                TensorShape::new([-1, 1, 4, 4]),
            ]))
            .with_bottoms(["relu"])
            .with_attr("flags", AttrValue::Map(BTreeMap::from([
                ("keep".to_string(), AttrValue::Bool(true)),
                ("names".to_string(), AttrValue::Strs(vec!["a".into(), "b".into()])),
            ]))),
        )
        .node(
            Node::new("out", "Identity", Shapes::tensor([-1, 1, 4, 4]))
                .with_bottoms(["split"])
                .as_output(),
        )
        .compiler_output(compiled)
        .build()
        .expect("annotated graph")
}

#[test]
fn json_round_trip_preserves_everything() {
    let graph = annotated_graph();
    let json = graph.to_json_string().unwrap();
    assert!(json.contains(GRAPH_FORMAT_VERSION));
    let restored = Graph::from_json_str(&json).unwrap();
    assert_eq!(restored, graph);
    assert_eq!(restored.names(), graph.names());
    assert!(restored.is_compiled());
}

#[test]
fn bincode_round_trip_preserves_everything() {
    let graph = annotated_graph();
    let bytes = graph.to_bincode_bytes().unwrap();
    let restored = Graph::from_bincode_slice(&bytes).unwrap();
    assert_eq!(restored, graph);
}

#[test]
fn collapsed_graph_survives_bincode() {
    let rewritten = build(annotated_graph(), "dpu", "XModel", "NCHW", Attrs::new()).unwrap();
    let collapsed = rewritten.node("xp0").unwrap();
    assert!(collapsed
        .attr("input_layers")
        .and_then(AttrValue::as_map)
        .is_some());
    assert!(collapsed.attr("rt_in_map").is_some());

    let bytes = rewritten.to_bincode_bytes().unwrap();
    let restored = Graph::from_bincode_slice(&bytes).unwrap();
    assert_eq!(restored, rewritten);
    let in_map = restored
        .node("xp0")
        .unwrap()
        .attr("rt_in_map")
        .and_then(AttrValue::as_map)
        .unwrap();
    assert_eq!(in_map["data"].as_str(), Some("xinput0"));
}

#[test]
fn saved_graph_loads_back() {
    let graph = annotated_graph();
    let path = std::env::temp_dir().join(format!("xgraph-io-{}.json", std::process::id()));
    graph.save_json(&path).unwrap();
    let restored = Graph::load_json(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(restored, graph);
}

#[test]
fn foreign_format_version_is_rejected() {
    let json = annotated_graph()
        .to_json_string()
        .unwrap()
        .replace(GRAPH_FORMAT_VERSION, "xgraph.v0");
    let err = Graph::from_json_str(&json).unwrap_err();
    assert!(matches!(
        err,
        GraphSerdeError::FormatVersionMismatch { ref found, .. } if found == "xgraph.v0"
    ));
}

#[test]
fn stored_graph_with_dangling_bottom_is_rejected() {
    let json = r#"{
        "format_version": "xgraph.v1",
        "name": "broken",
        "nodes": [
            {"name": "b", "type": ["ReLU"], "shapes": {"Tensor": [1]}, "bottoms": ["a"]}
        ]
    }"#;
    let err = Graph::from_json_str(json).unwrap_err();
    assert!(matches!(
        err,
        GraphSerdeError::Graph(GraphError::DanglingBottom { ref node, ref bottom })
            if node == "b" && bottom == "a"
    ));
}

#[test]
fn partition_snapshot_rebuilds_the_interior_graph() {
    let graph = annotated_graph();
    let partition = TaggedPartitioner
        .partitions(&graph)
        .unwrap()
        .remove("xp0")
        .unwrap();

    let json = serde_json::to_string(&partition).unwrap();
    let restored: xgraph::Partition = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, partition);
    let bytes = bincode::serialize(&partition).unwrap();
    let from_bytes: xgraph::Partition = bincode::deserialize(&bytes).unwrap();
    assert_eq!(from_bytes, partition);

    let interior = restored.subgraph().unwrap();
    assert_eq!(interior.names(), ["data", "conv", "relu"]);
    assert_eq!(interior.node("conv").unwrap().data.len(), 2);
    assert_eq!(interior.input_names(), ["data"]);
}
