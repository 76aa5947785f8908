use anyhow::{Context, Result};
use clap::Parser;
use code_relevance_backend_core::{DType, Pool, TowerMode};
use code_relevance_router::{pairs_from_args, read_pairs, resolve_model, run};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

/// App Configuration
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// The name of the model to load.
    /// Can be a MODEL_ID as listed on <https://hf.co/models> like
    /// `microsoft/codebert-base`.
    /// Or it can be a local directory containing the necessary files
    /// as saved by `save_pretrained(...)` methods of transformers
    #[clap(default_value = "microsoft/codebert-base", long, env)]
    model_id: String,

    /// The actual revision of the model if you're referring to a model
    /// on the hub. You can use a specific commit id or a branch like `refs/pr/2`.
    #[clap(long, env)]
    revision: Option<String>,

    /// The dtype to be forced upon the model.
    #[clap(long, env, value_enum)]
    dtype: Option<DType>,

    /// Optionally control the pooling method of the classification head.
    ///
    /// Defaults to `mean`, which averages every position including padding.
    #[clap(long, env, value_enum)]
    pooling: Option<Pool>,

    /// Whether the code and query encoders share their weights
    #[clap(default_value = "shared", long, env, value_enum)]
    towers: TowerMode,

    /// Inputs longer than this many tokens are truncated
    #[clap(default_value = "256", long, env)]
    max_input_length: usize,

    /// Natural-language query, paired by position with `--code`
    #[clap(long)]
    query: Vec<String>,

    /// Code snippet, paired by position with `--query`
    #[clap(long)]
    code: Vec<String>,

    /// JSON lines file of `{"query": ..., "code": ...}` objects
    #[clap(long, env, conflicts_with_all = ["query", "code"])]
    input: Option<PathBuf>,

    /// Also output the pre-logit features of every pair
    #[clap(long, env)]
    features: bool,

    /// Your Hugging Face Hub token
    #[clap(long, env)]
    hf_token: Option<String>,

    /// The location of the huggingface hub cache.
    /// Used to override the location if you want to provide a mounted disk for instance
    #[clap(long, env)]
    huggingface_hub_cache: Option<String>,

    /// Outputs the logs in JSON format (useful for telemetry)
    #[clap(long, env)]
    json_output: bool,

    // Whether or not to include the log trace through spans
    #[clap(long, env)]
    disable_spans: bool,
}


fn main() -> Result<()> {
    // Pattern match configuration
    let args: Args = Args::parse();

    code_relevance_router::init_logging(args.json_output, args.disable_spans);

    tracing::info!(
        model_id = %args.model_id,
        revision = ?args.revision,
        dtype = ?args.dtype,
        pooling = ?args.pooling,
        towers = %args.towers,
        max_input_length = args.max_input_length,
        "Starting"
    );

    let pairs = match &args.input {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("could not open {}", path.display()))?;
            read_pairs(BufReader::new(file))?
        }
        None => pairs_from_args(args.query, args.code)?,
    };

    let model_root = resolve_model(
        &args.model_id,
        args.revision,
        args.huggingface_hub_cache,
        args.hf_token,
    )?;

    let stdout = std::io::stdout();
    run(
        &model_root,
        args.dtype,
        args.pooling,
        args.towers,
        args.max_input_length,
        &pairs,
        args.features,
        &mut stdout.lock(),
    )?;

    Ok(())
}
