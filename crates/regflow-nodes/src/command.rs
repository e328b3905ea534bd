//! External Command Operation
//!
//! Runs an external tool with arguments rendered from the node's inputs and
//! static parameters, and reports the files it writes as output artifacts.
//! Uses `tokio::process::Command` for async execution with timeout support.
//!
//! Every invocation runs in its own directory,
//! `{work_dir}/{execution_id}/{node_id}`, so output file names only need to
//! be unique within one step.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use regflow_engine::{
    Artifact, ArtifactMap, Operation, OperationContext, OperationError, OperationResult,
};

use crate::config::{DEFAULT_COMMAND_TIMEOUT_SECS, PARAM_TIMEOUT_SECS, PARAM_WORK_DIR};

/// One piece of a command line
#[derive(Debug, Clone, PartialEq)]
pub enum ArgTemplate {
    /// Passed verbatim
    Literal(String),
    /// A required input; list artifacts expand to one argument per item
    Input(String),
    /// `flag value`, only when the input is present
    OptInput { flag: String, port: String },
    /// A required static parameter
    Param(String),
    /// `flag value`, only when the parameter is set
    OptParam { flag: String, key: String },
    /// `flag` alone, when the parameter is `true`
    Switch { flag: String, key: String },
    /// Path of a file product
    Output(String),
    /// One argument with `{name}` placeholders
    ///
    /// `{name}` resolves to an input, or else a parameter; `{@port}` to the
    /// path of a file product. List values are joined with `,`.
    Format(String),
}

/// An artifact the operation reports after the tool succeeds
#[derive(Debug, Clone, PartialEq)]
pub enum Product {
    /// A file the tool writes into its directory
    File { port: String, filename: String },
    /// Several files, reported as one list artifact
    Files { port: String, filenames: Vec<String> },
    /// A fixed value
    Value { port: String, value: Value },
    /// An input forwarded unchanged
    Passthrough { port: String, input: String },
}

impl Product {
    fn port(&self) -> &str {
        match self {
            Self::File { port, .. }
            | Self::Files { port, .. }
            | Self::Value { port, .. }
            | Self::Passthrough { port, .. } => port,
        }
    }
}

/// Captured result of a tool invocation
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// External Command Operation
///
/// Built once per operation kind and shared by every node of that kind.
///
/// # Parameters (from the node)
/// - `work_dir` - Base directory for step outputs (default: system temp dir)
/// - `timeout_secs` - Timeout of one invocation
/// - any key referenced by `Param`, `OptParam` or `Switch` templates
#[derive(Debug, Clone)]
pub struct CommandOperation {
    kind: String,
    program: String,
    args: Vec<ArgTemplate>,
    products: Vec<Product>,
    map_over: Vec<String>,
}

impl CommandOperation {
    pub fn new(kind: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            program: program.into(),
            args: Vec::new(),
            products: Vec::new(),
            map_over: Vec::new(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Append an argument template
    pub fn arg(mut self, arg: ArgTemplate) -> Self {
        self.args.push(arg);
        self
    }

    /// Append literal arguments
    pub fn lit(mut self, values: &[&str]) -> Self {
        self.args
            .extend(values.iter().map(|v| ArgTemplate::Literal(v.to_string())));
        self
    }

    pub fn input(self, port: &str) -> Self {
        self.arg(ArgTemplate::Input(port.to_string()))
    }

    pub fn opt_input(self, flag: &str, port: &str) -> Self {
        self.arg(ArgTemplate::OptInput {
            flag: flag.to_string(),
            port: port.to_string(),
        })
    }

    pub fn param(self, key: &str) -> Self {
        self.arg(ArgTemplate::Param(key.to_string()))
    }

    pub fn opt_param(self, flag: &str, key: &str) -> Self {
        self.arg(ArgTemplate::OptParam {
            flag: flag.to_string(),
            key: key.to_string(),
        })
    }

    pub fn format(self, pattern: &str) -> Self {
        self.arg(ArgTemplate::Format(pattern.to_string()))
    }

    pub fn switch(self, flag: &str, key: &str) -> Self {
        self.arg(ArgTemplate::Switch {
            flag: flag.to_string(),
            key: key.to_string(),
        })
    }

    /// Declare a file product and place its path on the command line here
    pub fn output(self, port: &str, filename: &str) -> Self {
        self.produces(port, filename)
            .arg(ArgTemplate::Output(port.to_string()))
    }

    /// Declare a file product the tool writes without being told its path
    pub fn produces(mut self, port: &str, filename: &str) -> Self {
        self.products.push(Product::File {
            port: port.to_string(),
            filename: filename.to_string(),
        });
        self
    }

    pub fn produces_files(mut self, port: &str, filenames: &[&str]) -> Self {
        self.products.push(Product::Files {
            port: port.to_string(),
            filenames: filenames.iter().map(|f| f.to_string()).collect(),
        });
        self
    }

    pub fn produces_value(mut self, port: &str, value: Value) -> Self {
        self.products.push(Product::Value {
            port: port.to_string(),
            value,
        });
        self
    }

    pub fn passthrough(mut self, port: &str, input: &str) -> Self {
        self.products.push(Product::Passthrough {
            port: port.to_string(),
            input: input.to_string(),
        });
        self
    }

    /// Run once per element of these list inputs, zipped
    ///
    /// Products of a mapped operation are lists in element order.
    pub fn mapped(mut self, ports: &[&str]) -> Self {
        self.map_over = ports.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Render the command line for one invocation
    pub fn command_line(
        &self,
        inputs: &ArtifactMap,
        params: &Value,
        dir: &Path,
    ) -> Result<Vec<String>, OperationError> {
        let mut line = Vec::new();
        for arg in &self.args {
            match arg {
                ArgTemplate::Literal(value) => line.push(value.clone()),
                ArgTemplate::Input(port) => {
                    let artifact = inputs
                        .get(port)
                        .ok_or_else(|| OperationError::MissingInput(port.clone()))?;
                    line.extend(render_artifact(port, artifact)?);
                }
                ArgTemplate::OptInput { flag, port } => {
                    if let Some(artifact) = inputs.get(port) {
                        line.push(flag.clone());
                        line.extend(render_artifact(port, artifact)?);
                    }
                }
                ArgTemplate::Param(key) => {
                    let value = params.get(key).ok_or_else(|| OperationError::InvalidInput {
                        port: key.clone(),
                        expected: "a static parameter".to_string(),
                    })?;
                    line.extend(render_value(value));
                }
                ArgTemplate::OptParam { flag, key } => {
                    if let Some(value) = params.get(key).filter(|v| !v.is_null()) {
                        line.push(flag.clone());
                        line.extend(render_value(value));
                    }
                }
                ArgTemplate::Switch { flag, key } => {
                    if params.get(key).and_then(Value::as_bool).unwrap_or(false) {
                        line.push(flag.clone());
                    }
                }
                ArgTemplate::Output(port) => line.push(self.output_path(port, dir)?),
                ArgTemplate::Format(pattern) => {
                    line.push(self.format_arg(pattern, inputs, params, dir)?)
                }
            }
        }
        Ok(line)
    }

    fn output_path(&self, port: &str, dir: &Path) -> Result<String, OperationError> {
        let filename = self.product_file(port).ok_or_else(|| {
            OperationError::failed(format!("'{}' declares no file product '{}'", self.kind, port))
        })?;
        Ok(dir.join(filename).display().to_string())
    }

    fn format_arg(
        &self,
        pattern: &str,
        inputs: &ArtifactMap,
        params: &Value,
        dir: &Path,
    ) -> Result<String, OperationError> {
        let mut rendered = String::with_capacity(pattern.len());
        let mut rest = pattern;
        while let Some(start) = rest.find('{') {
            rendered.push_str(&rest[..start]);
            let Some(len) = rest[start..].find('}') else {
                rendered.push_str(&rest[start..]);
                return Ok(rendered);
            };
            let name = &rest[start + 1..start + len];
            let value = if let Some(port) = name.strip_prefix('@') {
                self.output_path(port, dir)?
            } else if let Some(artifact) = inputs.get(name) {
                render_artifact(name, artifact)?.join(",")
            } else if let Some(value) = params.get(name) {
                render_value(value).join(",")
            } else {
                return Err(OperationError::MissingInput(name.to_string()));
            };
            rendered.push_str(&value);
            rest = &rest[start + len + 1..];
        }
        rendered.push_str(rest);
        Ok(rendered)
    }

    fn product_file(&self, port: &str) -> Option<&str> {
        self.products.iter().find_map(|p| match p {
            Product::File { port: p, filename } if p == port => Some(filename.as_str()),
            _ => None,
        })
    }

    /// Split the inputs into one map per invocation
    fn invocations(&self, inputs: &ArtifactMap) -> Result<Vec<ArtifactMap>, OperationError> {
        let Some(first) = self.map_over.first() else {
            return Ok(vec![inputs.clone()]);
        };

        let count = inputs
            .get(first)
            .ok_or_else(|| OperationError::MissingInput(first.clone()))?
            .to_list()
            .len();

        let mut columns = Vec::with_capacity(self.map_over.len());
        for port in &self.map_over {
            let Some(items) = inputs.get(port).map(Artifact::to_list) else {
                continue;
            };
            if items.len() != count {
                return Err(OperationError::ArityMismatch {
                    context: format!("mapped input '{port}'"),
                    expected: count,
                    actual: items.len(),
                });
            }
            columns.push((port, items));
        }

        Ok((0..count)
            .map(|i| {
                let mut each = inputs.clone();
                for (port, items) in &columns {
                    each.insert(port.to_string(), items[i].clone());
                }
                each
            })
            .collect())
    }

    async fn run_once(
        &self,
        ctx: &OperationContext,
        inputs: &ArtifactMap,
        dir: &Path,
    ) -> OperationResult {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            OperationError::failed(format!("Failed to create '{}': {}", dir.display(), e))
        })?;

        let args = self.command_line(inputs, ctx.params(), dir)?;
        run_tool(&self.program, &args, dir, timeout_of(ctx)).await?;

        let mut outputs = ArtifactMap::new();
        for product in &self.products {
            let artifact = match product {
                Product::File { filename, .. } => Artifact::path(existing(dir, filename).await?),
                Product::Files { filenames, .. } => {
                    let mut paths = Vec::with_capacity(filenames.len());
                    for filename in filenames {
                        paths.push(Artifact::path(existing(dir, filename).await?));
                    }
                    Artifact::List(paths)
                }
                Product::Value { value, .. } => Artifact::Value(value.clone()),
                Product::Passthrough { input, .. } => match inputs.get(input) {
                    Some(artifact) => artifact.clone(),
                    None => continue,
                },
            };
            outputs.insert(product.port().to_string(), artifact);
        }
        Ok(outputs)
    }
}

#[async_trait]
impl Operation for CommandOperation {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn execute(&self, ctx: &OperationContext, inputs: ArtifactMap) -> OperationResult {
        let dir = step_dir(ctx);
        if self.map_over.is_empty() {
            return self.run_once(ctx, &inputs, &dir).await;
        }

        let invocations = self.invocations(&inputs)?;

        log::debug!(
            "Node '{}': mapping '{}' over {} elements",
            ctx.node_id(),
            self.program,
            invocations.len()
        );
        let mut collected: Vec<(String, Vec<Artifact>)> = self
            .products
            .iter()
            .map(|p| (p.port().to_string(), Vec::new()))
            .collect();
        for (i, each) in invocations.iter().enumerate() {
            let mut produced = self.run_once(ctx, each, &dir.join(i.to_string())).await?;
            for (port, items) in collected.iter_mut() {
                if let Some(artifact) = produced.remove(port.as_str()) {
                    items.push(artifact);
                }
            }
        }
        Ok(collected
            .into_iter()
            .map(|(port, items)| (port, Artifact::List(items)))
            .collect())
    }
}

/// Directory of one step: `{work_dir}/{execution_id}/{node_id}`
pub fn step_dir(ctx: &OperationContext) -> PathBuf {
    let base = ctx
        .param(PARAM_WORK_DIR)
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("regflow"));
    base.join(ctx.execution_id()).join(ctx.node_id())
}

/// Invocation timeout configured on the node
pub fn timeout_of(ctx: &OperationContext) -> Duration {
    let secs = ctx
        .param(PARAM_TIMEOUT_SECS)
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Spawn a tool, wait for it and fail on a non-zero exit
pub async fn run_tool(
    program: &str,
    args: &[String],
    cwd: &Path,
    timeout: Duration,
) -> Result<ToolOutput, OperationError> {
    log::debug!(
        "Running '{}' with {} args in {}, timeout {}s",
        program,
        args.len(),
        cwd.display(),
        timeout.as_secs()
    );

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.current_dir(cwd);
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| OperationError::failed(format!("Failed to spawn '{}': {}", program, e)))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(OperationError::failed(format!(
                "Failed to wait for '{}': {}",
                program, e
            )))
        }
        Err(_) => {
            return Err(OperationError::failed(format!(
                "'{}' timed out after {}s",
                program,
                timeout.as_secs()
            )))
        }
    };

    let result = ToolOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };
    log::debug!(
        "'{}': exit_code={}, stdout={} bytes, stderr={} bytes",
        program,
        result.exit_code,
        result.stdout.len(),
        result.stderr.len()
    );

    if !output.status.success() {
        return Err(OperationError::failed(format!(
            "'{}' exited with code {}: {}",
            program,
            result.exit_code,
            result.stderr.trim()
        )));
    }
    Ok(result)
}

async fn existing(dir: &Path, filename: &str) -> Result<PathBuf, OperationError> {
    let path = dir.join(filename);
    match tokio::fs::try_exists(&path).await {
        Ok(true) => Ok(path),
        _ => Err(OperationError::failed(format!(
            "Expected output '{}' was not written",
            path.display()
        ))),
    }
}

fn render_artifact(port: &str, artifact: &Artifact) -> Result<Vec<String>, OperationError> {
    artifact
        .to_list()
        .iter()
        .map(|item| {
            item.to_arg().ok_or_else(|| OperationError::InvalidInput {
                port: port.to_string(),
                expected: "a path or scalar value".to_string(),
            })
        })
        .collect()
}

fn render_value(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::String(s) => vec![s.clone()],
        Value::Bool(b) => vec![if *b { "1" } else { "0" }.to_string()],
        Value::Number(n) => vec![n.to_string()],
        Value::Array(items) => items.iter().flat_map(render_value).collect(),
        Value::Object(map) => map
            .iter()
            .flat_map(|(k, v)| std::iter::once(k.clone()).chain(render_value(v)))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn touch() -> CommandOperation {
        CommandOperation::new("touch-file", "touch").output("out_file", "touched.txt")
    }

    #[test]
    fn test_command_line_rendering() {
        let op = CommandOperation::new("binarize", "ThresholdImage")
            .lit(&["3"])
            .input("in_file")
            .output("out_mask", "mask.nii.gz")
            .param("thresh_low")
            .lit(&["1e9"])
            .opt_input("-x", "mask")
            .switch("--float", "float");

        let mut inputs = ArtifactMap::new();
        inputs.insert("in_file".to_string(), Artifact::path("/data/probmap.nii.gz"));
        let params = json!({"thresh_low": 0.8, "float": true});

        let line = op.command_line(&inputs, &params, Path::new("/work/thr")).unwrap();
        assert_eq!(
            line,
            vec![
                "3",
                "/data/probmap.nii.gz",
                "/work/thr/mask.nii.gz",
                "0.8",
                "1e9",
                "--float"
            ]
        );
    }

    #[test]
    fn test_format_placeholders() {
        let op = CommandOperation::new("ants-ai", "antsAI")
            .format("Mattes[ {fixed_image}, {moving_image}, 32, {sampling}, 0.2 ]")
            .format("[ {@output_transform}, 1 ]")
            .produces("output_transform", "init.mat");

        let mut inputs = ArtifactMap::new();
        inputs.insert("fixed_image".to_string(), Artifact::path("tpl.nii.gz"));
        inputs.insert("moving_image".to_string(), Artifact::path("t2w.nii.gz"));
        let line = op
            .command_line(&inputs, &json!({"sampling": "Regular"}), Path::new("/w"))
            .unwrap();
        assert_eq!(line[0], "Mattes[ tpl.nii.gz, t2w.nii.gz, 32, Regular, 0.2 ]");
        assert_eq!(line[1], "[ /w/init.mat, 1 ]");

        let err = op
            .command_line(&inputs, &json!({}), Path::new("/w"))
            .unwrap_err();
        assert!(matches!(err, OperationError::MissingInput(name) if name == "sampling"));
    }

    #[test]
    fn test_missing_required_input() {
        let op = CommandOperation::new("clip", "ImageMath").input("in_file");
        let err = op
            .command_line(&ArtifactMap::new(), &json!({}), Path::new("/w"))
            .unwrap_err();
        assert!(matches!(err, OperationError::MissingInput(port) if port == "in_file"));
    }

    #[test]
    fn test_param_lists_and_maps() {
        assert_eq!(render_value(&json!([50, 50, 50])), vec!["50", "50", "50"]);
        assert_eq!(render_value(&json!({"2": 51, "3": 21})), vec!["2", "51", "3", "21"]);
        assert!(render_value(&Value::Null).is_empty());
    }

    #[tokio::test]
    async fn test_runs_in_step_directory() {
        let _ = env_logger::builder().is_test(true).try_init();
        let work = tempfile::tempdir().unwrap();
        let ctx = OperationContext::detached(
            "touch_step",
            json!({"work_dir": work.path().display().to_string(), "timeout_secs": 30}),
        );

        let outputs = touch().execute(&ctx, ArtifactMap::new()).await.unwrap();
        let path = outputs["out_file"].as_path().unwrap().to_path_buf();
        assert!(path.exists());
        assert!(path.starts_with(work.path().join("detached").join("touch_step")));
    }

    #[tokio::test]
    async fn test_mapped_invocations_collect_lists() {
        let work = tempfile::tempdir().unwrap();
        let ctx = OperationContext::detached(
            "per_hemi",
            json!({"work_dir": work.path().display().to_string()}),
        );
        let op = touch().input("hemi").mapped(&["hemi"]);

        let mut inputs = ArtifactMap::new();
        inputs.insert(
            "hemi".to_string(),
            Artifact::list([Artifact::text("lh.txt"), Artifact::text("rh.txt")]),
        );
        let outputs = op.execute(&ctx, inputs).await.unwrap();
        let files = outputs["out_file"].as_list().unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[1].as_path().unwrap().ends_with("1/touched.txt"));
    }

    #[tokio::test]
    async fn test_mapped_length_mismatch() {
        let ctx = OperationContext::detached("m", json!({}));
        let op = touch().mapped(&["white", "graymid"]);

        let mut inputs = ArtifactMap::new();
        inputs.insert(
            "white".to_string(),
            Artifact::list([Artifact::path("lh"), Artifact::path("rh")]),
        );
        inputs.insert("graymid".to_string(), Artifact::list([Artifact::path("lh")]));
        let err = op.execute(&ctx, inputs).await.unwrap_err();
        assert!(matches!(err, OperationError::ArityMismatch { expected: 2, actual: 1, .. }));
    }

    #[tokio::test]
    async fn test_failing_command() {
        let work = tempfile::tempdir().unwrap();
        let ctx = OperationContext::detached(
            "fails",
            json!({"work_dir": work.path().display().to_string()}),
        );
        let op = CommandOperation::new("false", "false");
        let err = op.execute(&ctx, ArtifactMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("exited with code 1"));
    }

    #[tokio::test]
    async fn test_missing_product_fails() {
        let work = tempfile::tempdir().unwrap();
        let ctx = OperationContext::detached(
            "quiet",
            json!({"work_dir": work.path().display().to_string()}),
        );
        let op = CommandOperation::new("noop", "true").produces("out_file", "never.nii.gz");
        let err = op.execute(&ctx, ArtifactMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("never.nii.gz"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let work = tempfile::tempdir().unwrap();
        let ctx = OperationContext::detached(
            "slow",
            json!({"work_dir": work.path().display().to_string(), "timeout_secs": 0}),
        );
        let op = CommandOperation::new("sleep", "sleep").lit(&["5"]);
        let err = op.execute(&ctx, ArtifactMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
