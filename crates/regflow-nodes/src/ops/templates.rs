//! Template identifiers and template-store lookups
//!
//! Templates are named like `MNIInfant:cohort-1:res-2`: a template name
//! followed by `key-value` specifiers. Files live in a TemplateFlow-style
//! store, `tpl-{name}/[cohort-{c}/]tpl-{name}[_cohort-{c}][_res-{r}]..._{suffix}.nii.gz`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use regflow_engine::{
    require, Artifact, ArtifactKind, ArtifactMap, DescribeOperation, Operation, OperationContext,
    OperationDescriptor, OperationError, OperationResult, PortSpec,
};

use crate::config::PARAM_TEMPLATEFLOW_HOME;
use crate::error::{PipelineError, Result};

/// A parsed template identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateId {
    pub name: String,
    pub spec: BTreeMap<String, String>,
}

impl TemplateId {
    /// Split `Name:key-value:...` into a name and its specifiers
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.split(':');
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(PipelineError::InvalidTemplate(raw.to_string()));
        }

        let mut spec = BTreeMap::new();
        for part in parts {
            let (key, value) = part
                .split_once('-')
                .filter(|(k, v)| !k.is_empty() && !v.is_empty())
                .ok_or_else(|| PipelineError::InvalidTemplate(raw.to_string()))?;
            spec.insert(key.to_string(), value.to_string());
        }
        Ok(Self {
            name: name.to_string(),
            spec,
        })
    }

    pub fn cohort(&self) -> Option<&str> {
        self.spec.get("cohort").map(String::as_str)
    }

    /// Label and remaining spec for downstream consumers
    ///
    /// The cohort moves into the label (`Name:cohort-N`); everything else
    /// stays in the spec.
    pub fn fmt_cohort(&self) -> (String, BTreeMap<String, String>) {
        let mut spec = self.spec.clone();
        let label = match spec.remove("cohort") {
            Some(cohort) => format!("{}:cohort-{}", self.name, cohort),
            None => self.name.clone(),
        };
        (label, spec)
    }

    /// Specifiers as a JSON object
    pub fn spec_value(spec: &BTreeMap<String, String>) -> Value {
        Value::Object(
            spec.iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }
}

/// Pre-computed transforms between the intermediate space and `std`
///
/// Returns `(intermediate -> std, std -> intermediate)`. A cohort in the
/// intermediate name is folded in as `Name+N`.
pub fn intermediate_xfms(data_dir: &Path, intermediate: &str, std: &str) -> (PathBuf, PathBuf) {
    let intmed = intermediate.replace(":cohort-", "+");
    let dir = data_dir.join("tpl_xfms");
    (
        dir.join(format!("from-{intmed}_to-{std}_xfm.h5")),
        dir.join(format!("from-{std}_to-{intmed}_xfm.h5")),
    )
}

/// A file query against the template store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateQuery {
    pub name: String,
    pub cohort: Option<String>,
    pub resolution: Option<String>,
    pub label: Option<String>,
    pub desc: Option<String>,
    pub suffix: String,
}

impl TemplateQuery {
    pub fn new(template: &TemplateId, suffix: impl Into<String>) -> Self {
        Self {
            name: template.name.clone(),
            cohort: template.spec.get("cohort").cloned(),
            resolution: template
                .spec
                .get("res")
                .or_else(|| template.spec.get("resolution"))
                .cloned(),
            label: None,
            desc: None,
            suffix: suffix.into(),
        }
    }

    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = Some(resolution.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    /// Path of the file under the store root
    pub fn path(&self, home: &Path) -> PathBuf {
        let mut dir = home.join(format!("tpl-{}", self.name));
        let mut filename = format!("tpl-{}", self.name);
        if let Some(cohort) = &self.cohort {
            dir = dir.join(format!("cohort-{cohort}"));
            filename.push_str(&format!("_cohort-{cohort}"));
        }
        for (key, value) in [
            ("res", &self.resolution),
            ("label", &self.label),
            ("desc", &self.desc),
        ] {
            if let Some(value) = value {
                filename.push_str(&format!("_{key}-{value}"));
            }
        }
        filename.push_str(&format!("_{}.nii.gz", self.suffix));
        dir.join(filename)
    }
}

/// Template files used by atlas-based brain extraction
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateFiles {
    /// Registration target (the T1w image; no T2w exists for every template)
    pub target: PathBuf,
    /// Brain probability map, or a binary brain mask when no map exists
    pub brain_mask: PathBuf,
    /// Registration mask, when the template has one
    pub registration_mask: Option<PathBuf>,
}

impl TemplateFiles {
    /// Look the files up in the store
    ///
    /// Requires a cohort in the template spec.
    pub fn locate(home: &Path, template: &TemplateId) -> Result<Self> {
        if template.cohort().is_none() {
            return Err(PipelineError::MissingCohort(template.name.clone()));
        }

        let target = TemplateQuery::new(template, "T1w").path(home);
        if !target.exists() {
            return Err(PipelineError::InvalidTemplate(format!(
                "{}: no T1w image at {}",
                template.name,
                target.display()
            )));
        }

        let probseg = TemplateQuery::new(template, "probseg").with_label("brain").path(home);
        let brain_mask = if probseg.exists() {
            probseg
        } else {
            TemplateQuery::new(template, "mask").with_desc("brain").path(home)
        };

        let regmask = TemplateQuery::new(template, "mask")
            .with_label("BrainCerebellumExtraction")
            .path(home);
        Ok(Self {
            target,
            brain_mask,
            registration_mask: regmask.exists().then_some(regmask),
        })
    }
}

/// Select a template's T1w image from the store
///
/// # Inputs
/// - `template` (required) - template name
/// - `template_spec` (optional) - JSON object of specifiers
///
/// # Parameters
/// - `templateflow_home` - store root
/// - `resolution` - used when the spec sets none (default 1)
pub struct TemplateSelect;

impl TemplateSelect {
    pub const KIND: &'static str = "template-select";

    pub const PORT_TEMPLATE: &'static str = "template";
    pub const PORT_TEMPLATE_SPEC: &'static str = "template_spec";
    pub const PORT_T1W_FILE: &'static str = "t1w_file";
}

impl DescribeOperation for TemplateSelect {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(
            Self::KIND,
            "Template Select",
            "Locate a template's T1w image in the template store",
        )
        .with_input(PortSpec::required(Self::PORT_TEMPLATE, ArtifactKind::Value))
        .with_input(PortSpec::optional(Self::PORT_TEMPLATE_SPEC, ArtifactKind::Value))
        .with_output(PortSpec::optional(Self::PORT_T1W_FILE, ArtifactKind::Volume))
    }
}

inventory::submit!(regflow_engine::OperationFn {
    descriptor: TemplateSelect::descriptor,
    factory: || Arc::new(TemplateSelect),
});

#[async_trait]
impl Operation for TemplateSelect {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn execute(&self, ctx: &OperationContext, inputs: ArtifactMap) -> OperationResult {
        let name = require(&inputs, Self::PORT_TEMPLATE)?
            .as_str()
            .ok_or_else(|| OperationError::InvalidInput {
                port: Self::PORT_TEMPLATE.to_string(),
                expected: "a template name".to_string(),
            })?;

        let mut template = TemplateId {
            name: name.to_string(),
            spec: BTreeMap::new(),
        };
        let spec = inputs
            .get(Self::PORT_TEMPLATE_SPEC)
            .and_then(Artifact::as_value);
        if let Some(Value::Object(spec)) = spec {
            for (key, value) in spec {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                template.spec.insert(key.clone(), value);
            }
        }

        let mut query = TemplateQuery::new(&template, "T1w");
        if query.resolution.is_none() {
            let resolution = ctx
                .param("resolution")
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .unwrap_or_else(|| "1".to_string());
            query = query.with_resolution(resolution);
        }

        let home = ctx
            .param(PARAM_TEMPLATEFLOW_HOME)
            .and_then(Value::as_str)
            .ok_or_else(|| OperationError::failed("No template store configured"))?;
        let path = query.path(Path::new(home));
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(OperationError::failed(format!(
                "No T1w image for template '{}' at {}",
                template.name,
                path.display()
            )));
        }

        log::debug!("Node '{}': selected {}", ctx.node_id(), path.display());
        let mut outputs = ArtifactMap::new();
        outputs.insert(Self::PORT_T1W_FILE.to_string(), Artifact::path(path));
        Ok(outputs)
    }
}
