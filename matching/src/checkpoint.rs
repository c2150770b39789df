//! Saving and loading model parameters.

use crate::common::*;
use regex::Regex;

pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";
const CHECKPOINT_FILENAME_PATTERN: &str =
    r"^(\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}\.\d{3}[+-]\d{4})_\d{6}_[^_]+\.ckpt$";

/// Checkpoint file loading method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LoadCheckpoint {
    /// Disable checkpoint file loading.
    Disabled,
    /// Load the most recent checkpoint file in the checkpoint directory.
    FromRecent,
    /// Load the checkpoint file at specified path.
    FromFile { file: PathBuf },
}

impl Default for LoadCheckpoint {
    fn default() -> Self {
        Self::Disabled
    }
}

/// Save parameters to a checkpoint file and return its path.
pub fn save_checkpoint(
    vs: &nn::VarStore,
    checkpoint_dir: &Path,
    training_step: usize,
    loss: f64,
) -> Result<PathBuf> {
    let filename = format!(
        "{}_{:06}_{:08.5}.ckpt",
        Local::now().format(FILE_STRFTIME),
        training_step,
        loss
    );
    let path = checkpoint_dir.join(filename);
    vs.save(&path)
        .with_context(|| format!("failed to save checkpoint '{}'", path.display()))?;
    info!("saved checkpoint {}", path.display());
    Ok(path)
}

/// Finds the checkpoint file with the latest timestamp in a directory.
pub fn find_recent_checkpoint(checkpoint_dir: &Path) -> Result<Option<PathBuf>> {
    let filename_regex = Regex::new(CHECKPOINT_FILENAME_PATTERN)?;
    let paths: Vec<_> = glob::glob(&format!("{}/*.ckpt", checkpoint_dir.display()))?
        .try_collect()?;

    let recent = paths
        .into_iter()
        .filter_map(|path| {
            let file_name = path.file_name()?.to_str()?;
            let captures = filename_regex.captures(file_name)?;
            let datetime_str = captures.get(1)?.as_str();
            let datetime = DateTime::parse_from_str(datetime_str, FILE_STRFTIME).ok()?;
            Some((path, datetime))
        })
        .max_by_key(|(_path, datetime)| *datetime)
        .map(|(path, _datetime)| path);

    Ok(recent)
}

/// Load parameters with specified checkpoint loading method.
///
/// Returns the path of the loaded file if any.
pub fn try_load_checkpoint(
    vs: &mut nn::VarStore,
    checkpoint_dir: &Path,
    load_checkpoint: &LoadCheckpoint,
) -> Result<Option<PathBuf>> {
    let path = match load_checkpoint {
        LoadCheckpoint::Disabled => {
            info!("checkpoint loading is disabled");
            None
        }
        LoadCheckpoint::FromRecent => {
            let checkpoint_file = find_recent_checkpoint(checkpoint_dir)?;
            if checkpoint_file.is_none() {
                warn!("no checkpoint file found in {}", checkpoint_dir.display());
            }
            checkpoint_file
        }
        LoadCheckpoint::FromFile { file } => {
            if file.is_file() {
                Some(file.to_owned())
            } else {
                warn!("{} is not a file", file.display());
                None
            }
        }
    };

    if let Some(path) = &path {
        info!("load checkpoint file {}", path.display());
        vs.load_partial(path)
            .with_context(|| format!("failed to load checkpoint '{}'", path.display()))?;
    }

    Ok(path)
}
