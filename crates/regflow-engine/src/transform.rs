//! Spatial transform chains and their composition into graph nodes
//!
//! A chain is declared in the order transforms are listed to the
//! concatenation tool; the tool applies them last-to-first. Invert flags are
//! index-aligned with the transforms and default to "do not invert".

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::builder::GraphBuilder;
use crate::error::{OperationError, RegflowError, Result};
use crate::node::{require, Merge, Node, NodeHandle, Operation, OperationContext, OperationResult};
use crate::registry::OperationRegistry;
use crate::topology::{gather, replicate, ParallelLists};
use crate::types::{Artifact, ArtifactKind, ArtifactMap, PortRef, PortSpec, ResourceHint, Source};

/// Input port carrying the transform list
pub const PORT_TRANSFORMS: &str = "transforms";
/// Input port carrying the invert flags
pub const PORT_INVERT_FLAGS: &str = "invert_transform_flags";
/// Input port carrying the reference image
pub const PORT_REFERENCE: &str = "reference_image";
/// Output port carrying the composite transform
pub const PORT_OUT_XFM: &str = "out_xfm";

/// One element of a chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub artifact: Artifact,
    pub invert: bool,
}

impl Transform {
    pub fn new(artifact: Artifact) -> Self {
        Self {
            artifact,
            invert: false,
        }
    }

    pub fn inverted(artifact: Artifact) -> Self {
        Self {
            artifact,
            invert: true,
        }
    }
}

/// Ordered sequence of transforms
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformChain {
    transforms: Vec<Transform>,
}

impl TransformChain {
    pub fn new(transforms: Vec<Transform>) -> Self {
        Self { transforms }
    }

    /// Pair transforms with optional invert flags
    ///
    /// Missing flags mean no inversion; flags of a different length are an
    /// `ArityMismatch`.
    pub fn from_parts(transforms: Vec<Artifact>, invert_flags: Option<Vec<bool>>) -> Result<Self> {
        let flags = match invert_flags {
            Some(flags) if flags.len() != transforms.len() => {
                return Err(RegflowError::arity(
                    "transform invert flags",
                    transforms.len(),
                    flags.len(),
                ));
            }
            Some(flags) => flags,
            None => vec![false; transforms.len()],
        };

        Ok(Self {
            transforms: transforms
                .into_iter()
                .zip(flags)
                .map(|(artifact, invert)| Transform { artifact, invert })
                .collect(),
        })
    }

    /// Read a chain from the inputs of a concatenation node
    pub fn from_inputs(inputs: &ArtifactMap) -> std::result::Result<Self, OperationError> {
        let transforms = require(inputs, PORT_TRANSFORMS)?.to_list();
        let flags = match inputs.get(PORT_INVERT_FLAGS) {
            None => None,
            Some(artifact) => Some(parse_flags(artifact)?),
        };

        Self::from_parts(transforms, flags).map_err(|e| match e {
            RegflowError::ArityMismatch {
                context,
                expected,
                actual,
            } => OperationError::ArityMismatch {
                context,
                expected,
                actual,
            },
            other => OperationError::Graph(other),
        })
    }

    /// Transforms in declaration order
    pub fn declared(&self) -> &[Transform] {
        &self.transforms
    }

    /// Transforms in the order they act on a point: last declared first
    pub fn application_order(&self) -> impl Iterator<Item = &Transform> {
        self.transforms.iter().rev()
    }

    /// Append another chain after this one in declaration order
    ///
    /// The appended chain therefore acts first.
    pub fn concat(mut self, other: TransformChain) -> Self {
        self.transforms.extend(other.transforms);
        self
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Invert flags in declaration order
    pub fn invert_flags(&self) -> Vec<bool> {
        self.transforms.iter().map(|t| t.invert).collect()
    }

    /// Render `--transform` arguments in declaration order
    ///
    /// Inverted elements use the `[ path, 1 ]` form.
    pub fn to_arguments(&self) -> std::result::Result<Vec<String>, OperationError> {
        let mut args = Vec::with_capacity(self.transforms.len() * 2);
        for (i, transform) in self.transforms.iter().enumerate() {
            let path = transform.artifact.to_arg().ok_or_else(|| OperationError::InvalidInput {
                port: format!("{PORT_TRANSFORMS}[{i}]"),
                expected: "a transform file".to_string(),
            })?;
            args.push("--transform".to_string());
            if transform.invert {
                args.push(format!("[ {path}, 1 ]"));
            } else {
                args.push(path);
            }
        }
        Ok(args)
    }
}

fn parse_flags(artifact: &Artifact) -> std::result::Result<Vec<bool>, OperationError> {
    let invalid = || OperationError::InvalidInput {
        port: PORT_INVERT_FLAGS.to_string(),
        expected: "a list of booleans".to_string(),
    };

    match artifact {
        Artifact::List(items) => items
            .iter()
            .map(|item| item.as_value().and_then(|v| v.as_bool()).ok_or_else(invalid))
            .collect(),
        Artifact::Value(serde_json::Value::Array(items)) => items
            .iter()
            .map(|v| v.as_bool().ok_or_else(invalid))
            .collect(),
        Artifact::Value(serde_json::Value::Bool(flag)) => Ok(vec![*flag]),
        _ => Err(invalid()),
    }
}

/// Produces a JSON description of the composite instead of a file
///
/// Used for dry runs and tests; the description lists the transforms in
/// application order.
pub struct DescribeChain;

#[async_trait]
impl Operation for DescribeChain {
    fn kind(&self) -> &str {
        "describe-chain"
    }

    async fn execute(&self, _ctx: &OperationContext, inputs: ArtifactMap) -> OperationResult {
        let chain = TransformChain::from_inputs(&inputs)?;
        let applied: Vec<&Transform> = chain.application_order().collect();
        let description = serde_json::json!({
            "applied": applied,
            "reference": inputs.get(PORT_REFERENCE).and_then(|r| r.to_arg()),
        });

        let mut outputs = ArtifactMap::new();
        outputs.insert(PORT_OUT_XFM.to_string(), Artifact::Value(description));
        Ok(outputs)
    }
}

/// Inputs of a multi-hop composition
///
/// The per-template columns are index-aligned; `ArityMismatch` otherwise.
#[derive(Debug, Clone, Default)]
pub struct MultiHopRequest {
    /// native -> intermediate transform(s)
    pub anat2int: Option<Source>,
    /// intermediate -> native transform(s)
    pub int2anat: Option<Source>,
    /// Native-space reference image for the template -> native composite
    pub anat_reference: Option<Source>,
    /// Output template label per hop
    pub templates: Vec<String>,
    /// Template specifier per hop
    pub template_specs: Vec<serde_json::Value>,
    /// intermediate -> template transform per hop
    pub int2std: Vec<Artifact>,
    /// template -> intermediate transform per hop
    pub std2int: Vec<Artifact>,
    /// Template-space reference image per hop
    pub std_references: Vec<Source>,
}

/// Nodes built for one hop
#[derive(Debug, Clone)]
pub struct HopNodes {
    pub anat2std: NodeHandle,
    pub std2anat: NodeHandle,
}

/// List-valued ports of a multi-hop composition, index-aligned per template
#[derive(Debug, Clone)]
pub struct MultiHopOutputs {
    pub anat2std: PortRef,
    pub std2anat: PortRef,
    pub template: PortRef,
    pub template_spec: PortRef,
    pub hops: Vec<HopNodes>,
}

/// Adds transform concatenation nodes to a graph
#[derive(Clone)]
pub struct TransformComposer {
    operation: Arc<dyn Operation>,
    resources: Option<ResourceHint>,
    params: serde_json::Value,
}

impl TransformComposer {
    /// Compose with the given concatenation operation
    pub fn new(operation: Arc<dyn Operation>) -> Self {
        Self {
            operation,
            resources: None,
            params: serde_json::Value::Null,
        }
    }

    /// Compose with `DescribeChain`
    pub fn describing() -> Self {
        Self::new(Arc::new(DescribeChain))
    }

    /// Compose with the registry's operation of `kind`
    pub fn from_registry(registry: &OperationRegistry, kind: &str) -> Result<Self> {
        let node = registry.instantiate(kind, kind)?;
        Ok(Self {
            operation: node.operation,
            resources: node.resources,
            params: serde_json::Value::Null,
        })
    }

    /// Hint attached to every concatenation node
    pub fn with_resources(mut self, hint: ResourceHint) -> Self {
        self.resources = Some(hint);
        self
    }

    /// Static parameters attached to every concatenation node
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// A bare concatenation node
    pub fn chain_node(&self, name: impl Into<String>) -> Node {
        let mut node = Node::new(name, Arc::clone(&self.operation))
            .required_input(PORT_TRANSFORMS, ArtifactKind::Transform)
            .input(PORT_INVERT_FLAGS, ArtifactKind::Value)
            .required_input(PORT_REFERENCE, ArtifactKind::Volume)
            .output(PORT_OUT_XFM, ArtifactKind::Transform);
        node.resources = self.resources;
        node.params = self.params.clone();
        node
    }

    /// Add a concatenation node producing one composite transform
    ///
    /// A static transform list is checked against the flags right away;
    /// a list arriving over an edge is checked when the node runs.
    pub fn add_chain_node(
        &self,
        builder: &mut GraphBuilder,
        name: &str,
        transforms: impl Into<Source>,
        reference: impl Into<Source>,
        invert_flags: Option<Vec<bool>>,
    ) -> Result<NodeHandle> {
        let transforms = transforms.into();
        if let (Source::Value(list), Some(flags)) = (&transforms, &invert_flags) {
            TransformChain::from_parts(list.to_list(), Some(flags.clone()))?;
        }

        let node = builder.add_node(self.chain_node(name))?;
        builder.bind(transforms, node.input(PORT_TRANSFORMS))?;
        builder.bind(reference, node.input(PORT_REFERENCE))?;
        if let Some(flags) = invert_flags {
            builder.set_static(
                node.input(PORT_INVERT_FLAGS),
                Artifact::list(flags.into_iter().map(Artifact::flag)),
            )?;
        }
        Ok(node)
    }

    /// Compose native -> intermediate -> template for every requested template
    ///
    /// Per hop `i` this adds `merge_anat2std_{i}` (`[int2std, anat2int]`),
    /// `merge_std2anat_{i}` (`[std2int, int2anat]`) and the two concatenation
    /// nodes; the results and the template labels are gathered into
    /// list-valued ports in request order.
    pub fn compose_multi_hop(
        &self,
        builder: &mut GraphBuilder,
        request: &MultiHopRequest,
    ) -> Result<MultiHopOutputs> {
        let lists = ParallelLists::new()
            .column("template", request.templates.iter().map(Artifact::text))
            .column(
                "template_spec",
                request.template_specs.iter().cloned().map(Artifact::Value),
            )
            .column("int2std", request.int2std.iter().cloned())
            .column("std2int", request.std2int.iter().cloned());
        let rows = lists.len()?;
        if request.std_references.len() != rows {
            return Err(RegflowError::arity(
                "template reference images",
                rows,
                request.std_references.len(),
            ));
        }

        let hops = replicate(builder, &lists, |b, row| {
            let i = row.index;

            let merge_anat2std = b.add_node(Merge::node(format!("merge_anat2std_{i}"), 2))?;
            if let Some(int2std) = row.get("int2std") {
                b.set_static(merge_anat2std.input("in1"), int2std.clone())?;
            }
            if let Some(anat2int) = &request.anat2int {
                b.bind(anat2int.clone(), merge_anat2std.input("in2"))?;
            }

            let merge_std2anat = b.add_node(Merge::node(format!("merge_std2anat_{i}"), 2))?;
            if let Some(std2int) = row.get("std2int") {
                b.set_static(merge_std2anat.input("in1"), std2int.clone())?;
            }
            if let Some(int2anat) = &request.int2anat {
                b.bind(int2anat.clone(), merge_std2anat.input("in2"))?;
            }

            let anat2std = self.add_chain_node(
                b,
                &format!("concat_anat2std_{i}"),
                merge_anat2std.output("out"),
                request.std_references[i].clone(),
                None,
            )?;
            let std2anat = b.add_node(self.chain_node(format!("concat_std2anat_{i}")))?;
            b.connect(merge_std2anat.output("out"), std2anat.input(PORT_TRANSFORMS))?;
            if let Some(reference) = &request.anat_reference {
                b.bind(reference.clone(), std2anat.input(PORT_REFERENCE))?;
            }

            Ok(HopNodes { anat2std, std2anat })
        })?;

        let anat2std: Vec<PortRef> = hops.iter().map(|h| h.anat2std.output(PORT_OUT_XFM)).collect();
        let std2anat: Vec<PortRef> = hops.iter().map(|h| h.std2anat.output(PORT_OUT_XFM)).collect();
        let anat2std = gather(builder, "gather_anat2std", &anat2std)?;
        let std2anat = gather(builder, "gather_std2anat", &std2anat)?;

        let template = builder.add_node(Merge::node("gather_template", rows))?;
        let template_spec = builder.add_node(Merge::node("gather_template_spec", rows))?;
        for i in 0..rows {
            let port = format!("in{}", i + 1);
            builder.set_static(template.input(&port), Artifact::text(&request.templates[i]))?;
            builder.set_static(
                template_spec.input(&port),
                Artifact::Value(request.template_specs[i].clone()),
            )?;
        }

        Ok(MultiHopOutputs {
            anat2std: anat2std.output("out"),
            std2anat: std2anat.output("out"),
            template: template.output("out"),
            template_spec: template_spec.output("out"),
            hops,
        })
    }
}

/// Port declarations of a concatenation operation, for descriptors
pub fn chain_ports() -> (Vec<PortSpec>, Vec<PortSpec>) {
    (
        vec![
            PortSpec::required(PORT_TRANSFORMS, ArtifactKind::Transform),
            PortSpec::optional(PORT_INVERT_FLAGS, ArtifactKind::Value),
            PortSpec::required(PORT_REFERENCE, ArtifactKind::Volume),
        ],
        vec![PortSpec::optional(PORT_OUT_XFM, ArtifactKind::Transform)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::Scheduler;

    fn a() -> Artifact {
        Artifact::path("A.h5")
    }

    fn b() -> Artifact {
        Artifact::path("B.mat")
    }

    #[test]
    fn test_no_flags_applies_last_first_uninverted() {
        let chain = TransformChain::from_parts(vec![a(), b()], None).unwrap();
        let applied: Vec<_> = chain.application_order().collect();
        assert_eq!(applied, vec![&Transform::new(b()), &Transform::new(a())]);
        assert_eq!(chain.invert_flags(), vec![false, false]);
    }

    #[test]
    fn test_flag_arity_mismatch() {
        let err = TransformChain::from_parts(vec![a(), b()], Some(vec![true])).unwrap_err();
        assert!(matches!(
            err,
            RegflowError::ArityMismatch { expected: 2, actual: 1, .. }
        ));
    }

    #[test]
    fn test_arguments_render_inversion() {
        let chain = TransformChain::from_parts(vec![a(), b()], Some(vec![true, false])).unwrap();
        assert_eq!(
            chain.to_arguments().unwrap(),
            vec!["--transform", "[ A.h5, 1 ]", "--transform", "B.mat"]
        );
    }

    #[test]
    fn test_concat_appends() {
        let chain = TransformChain::from_parts(vec![a()], None)
            .unwrap()
            .concat(TransformChain::new(vec![Transform::inverted(b())]));
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.application_order().next(), Some(&Transform::inverted(b())));
    }

    #[test]
    fn test_from_inputs_runtime_mismatch() {
        let mut inputs = ArtifactMap::new();
        inputs.insert(PORT_TRANSFORMS.to_string(), Artifact::list([a(), b()]));
        inputs.insert(PORT_INVERT_FLAGS.to_string(), Artifact::list([Artifact::flag(true)]));
        let err = TransformChain::from_inputs(&inputs).unwrap_err();
        assert!(matches!(err, OperationError::ArityMismatch { .. }));
    }

    #[test]
    fn test_static_chain_checked_at_build_time() {
        let mut builder = GraphBuilder::new("wf");
        let err = TransformComposer::describing()
            .add_chain_node(
                &mut builder,
                "concat",
                Artifact::list([a(), b()]),
                Artifact::path("ref.nii.gz"),
                Some(vec![true]),
            )
            .unwrap_err();
        assert!(matches!(err, RegflowError::ArityMismatch { .. }));
        assert!(!builder.contains("concat"));
    }

    async fn composite(flags: Vec<bool>) -> Artifact {
        let mut builder = GraphBuilder::new("wf");
        let out = builder.declare_output("xfm", ArtifactKind::Transform);
        let node = TransformComposer::describing()
            .add_chain_node(
                &mut builder,
                "concat",
                Artifact::list([a(), b()]),
                Artifact::path("ref.nii.gz"),
                Some(flags),
            )
            .unwrap();
        builder.connect(node.output(PORT_OUT_XFM), out).unwrap();
        let graph = builder.build().unwrap();

        let outputs = Scheduler::new(SchedulerConfig::default())
            .run(&graph, ArtifactMap::new())
            .await
            .unwrap()
            .into_outputs()
            .unwrap();
        outputs.get("xfm").cloned().unwrap()
    }

    #[tokio::test]
    async fn test_invert_flags_change_composite() {
        let first = composite(vec![true, false]).await;
        let second = composite(vec![false, true]).await;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_multi_hop_three_templates_index_aligned() {
        let templates = ["MNI152NLin6Asym", "MNIPediatricAsym:cohort-2", "UNCInfant:cohort-1"];
        let request = MultiHopRequest {
            anat2int: Some(PortRef::new("inputnode", "anat2int_xfm").into()),
            int2anat: Some(PortRef::new("inputnode", "int2anat_xfm").into()),
            anat_reference: Some(PortRef::new("inputnode", "anat_preproc").into()),
            templates: templates.iter().map(|t| t.to_string()).collect(),
            template_specs: (0..3).map(|i| serde_json::json!({ "res": i })).collect(),
            int2std: (0..3).map(|i| Artifact::path(format!("int2std_{i}.h5"))).collect(),
            std2int: (0..3).map(|i| Artifact::path(format!("std2int_{i}.h5"))).collect(),
            std_references: (0..3)
                .map(|i| Artifact::path(format!("tpl_{i}_T1w.nii.gz")).into())
                .collect(),
        };

        let mut builder = GraphBuilder::new("concat_registrations_wf");
        builder.inputs(&[
            ("anat2int_xfm", ArtifactKind::Transform),
            ("int2anat_xfm", ArtifactKind::Transform),
            ("anat_preproc", ArtifactKind::Volume),
        ]);
        let composed = TransformComposer::describing()
            .compose_multi_hop(&mut builder, &request)
            .unwrap();
        for (name, port) in [
            ("anat2std_xfm", &composed.anat2std),
            ("std2anat_xfm", &composed.std2anat),
            ("template", &composed.template),
            ("template_spec", &composed.template_spec),
        ] {
            let out = builder.declare_output(name, ArtifactKind::Any);
            builder.connect(port.clone(), out).unwrap();
        }
        let graph = builder.build().unwrap();
        assert_eq!(composed.hops.len(), 3);

        let mut inputs = ArtifactMap::new();
        inputs.insert("anat2int_xfm".to_string(), Artifact::path("anat2int.h5"));
        inputs.insert("int2anat_xfm".to_string(), Artifact::path("int2anat.h5"));
        inputs.insert("anat_preproc".to_string(), Artifact::path("anat.nii.gz"));
        let outputs = Scheduler::new(SchedulerConfig::default())
            .run(&graph, inputs)
            .await
            .unwrap()
            .into_outputs()
            .unwrap();

        let labels = outputs.get("template").unwrap().to_list();
        assert_eq!(labels, templates.map(Artifact::text).to_vec());

        let anat2std = outputs.get("anat2std_xfm").unwrap().to_list();
        assert_eq!(anat2std.len(), 3);
        for (i, composite) in anat2std.iter().enumerate() {
            let description = composite.as_value().unwrap();
            // anat2int acts first, then int2std
            assert_eq!(description["applied"][0]["artifact"]["value"], "anat2int.h5");
            assert_eq!(
                description["applied"][1]["artifact"]["value"],
                format!("int2std_{i}.h5")
            );
            assert_eq!(description["reference"], format!("tpl_{i}_T1w.nii.gz"));
        }

        let std2anat = outputs.get("std2anat_xfm").unwrap().to_list();
        assert_eq!(std2anat[2].as_value().unwrap()["reference"], "anat.nii.gz");
    }

    #[test]
    fn test_multi_hop_arity_mismatch() {
        let request = MultiHopRequest {
            templates: vec!["MNI152NLin6Asym".to_string(), "UNCInfant".to_string()],
            template_specs: vec![serde_json::json!({}), serde_json::json!({})],
            int2std: vec![Artifact::path("x.h5")],
            std2int: vec![Artifact::path("y.h5"), Artifact::path("z.h5")],
            std_references: vec![],
            ..Default::default()
        };
        let mut builder = GraphBuilder::new("wf");
        let err = TransformComposer::describing()
            .compose_multi_hop(&mut builder, &request)
            .unwrap_err();
        assert!(matches!(err, RegflowError::ArityMismatch { .. }));
    }
}
