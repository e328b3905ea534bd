//! Native -> template transforms through an intermediate template
//!
//! The anatomical image is registered once to an intermediate template;
//! stored intermediate <-> template transforms then reach every requested
//! output template. One hop (two merges, two concatenations, one template
//! lookup) is built per template, in request order.
//!
//! # Inputs
//! - `anat_preproc` - native reference for the template -> native composite
//! - `anat2std_xfm`, `std2anat_xfm` - native <-> intermediate transforms
//!
//! # Outputs (index-aligned lists, one entry per template)
//! - `anat2std_xfm`, `std2anat_xfm`, `template`, `template_spec`

use serde_json::json;

use regflow_engine::{
    Artifact, ArtifactKind, Graph, GraphBuilder, MultiHopRequest, OperationRegistry, Source,
    TransformComposer,
};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::ops::{intermediate_xfms, ConcatXfm, TemplateId, TemplateSelect};
use crate::pipelines::step;

#[derive(Debug, Clone, PartialEq)]
pub struct ConcatRegistrationsFlags {
    pub name: String,
    /// Output templates, e.g. `MNI152NLin6Asym` or `MNIPediatricAsym:cohort-4`
    pub templates: Vec<String>,
    /// The intermediate template, e.g. `MNIInfant:cohort-1`
    pub intermediate: String,
}

impl ConcatRegistrationsFlags {
    pub fn new(templates: Vec<String>, intermediate: impl Into<String>) -> Self {
        Self {
            name: "concat_registrations_wf".to_string(),
            templates,
            intermediate: intermediate.into(),
        }
    }
}

pub fn build_concat_registrations(
    flags: &ConcatRegistrationsFlags,
    config: &PipelineConfig,
    registry: &OperationRegistry,
) -> Result<Graph> {
    let mut b = GraphBuilder::new(&flags.name);

    let anat_preproc = b.input("anat_preproc", ArtifactKind::Volume);
    let anat2int = b.input("anat2std_xfm", ArtifactKind::Transform);
    let int2anat = b.input("std2anat_xfm", ArtifactKind::Transform);

    let out_anat2std = b.declare_output("anat2std_xfm", ArtifactKind::Transform);
    let out_std2anat = b.declare_output("std2anat_xfm", ArtifactKind::Transform);
    let out_template = b.declare_output("template", ArtifactKind::Value);
    let out_template_spec = b.declare_output("template_spec", ArtifactKind::Value);

    let mut request = MultiHopRequest {
        anat2int: Some(anat2int.into()),
        int2anat: Some(int2anat.into()),
        anat_reference: Some(anat_preproc.into()),
        ..Default::default()
    };

    for (i, raw) in flags.templates.iter().enumerate() {
        let template = TemplateId::parse(raw)?;
        let (label, spec) = template.fmt_cohort();
        let (int2std, std2int) = intermediate_xfms(&config.data_dir, &flags.intermediate, raw);

        // Template-space reference image for the native -> template composite
        let tf_select = b.add_node(
            step(
                registry,
                config,
                &format!("tf_select_{i}"),
                TemplateSelect::KIND,
                json!({ "resolution": "1" }),
            )?
            .with_static(TemplateSelect::PORT_TEMPLATE, Artifact::text(&template.name))
            .with_static(
                TemplateSelect::PORT_TEMPLATE_SPEC,
                Artifact::Value(TemplateId::spec_value(&template.spec)),
            ),
        )?;

        request.templates.push(label);
        request.template_specs.push(TemplateId::spec_value(&spec));
        request.int2std.push(Artifact::path(int2std));
        request.std2int.push(Artifact::path(std2int));
        request
            .std_references
            .push(Source::Port(tf_select.output(TemplateSelect::PORT_T1W_FILE)));
    }

    // Resource hint comes from the concatenation descriptor
    let composer = TransformComposer::from_registry(registry, ConcatXfm::KIND)?
        .with_params(config.step_params(json!({})));
    let composed = composer.compose_multi_hop(&mut b, &request)?;
    log::debug!(
        "Graph '{}': {} hops through '{}'",
        flags.name,
        composed.hops.len(),
        flags.intermediate
    );

    b.connect(composed.anat2std, out_anat2std)?;
    b.connect(composed.std2anat, out_std2anat)?;
    b.connect(composed.template, out_template)?;
    b.connect(composed.template_spec, out_template_spec)?;

    Ok(b.build()?)
}
