use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docpump_dispatch::DispatcherConfig;
use docpump_engine::{default_engine, LopdfEngine, PdfSession, Rotation, ThumbnailSize};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "docpump")]
#[command(about = "Inspect and edit PDFs through a serialized document engine")]
pub struct Cli {
    /// Worker threads for the engine dispatcher.
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Dispatcher configuration file (TOML).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log dispatcher and engine activity to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print machine-readable PDF metadata.
    Info {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Render a thumbnail PNG for a page.
    RenderThumb {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 320)]
        width: u32,
        #[arg(long, default_value_t = 320)]
        height: u32,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the text of one page, or of every page.
    Text {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long)]
        page: Option<u32>,
    },
    /// Rotate a page and save the result.
    Rotate {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long)]
        page: u32,
        /// Clockwise quarter turns, 0 to 3.
        #[arg(long)]
        quarter_turns: u8,
        #[arg(long)]
        output: PathBuf,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Serialize)]
struct InfoOutput {
    path: String,
    page_count: u32,
    first_page_size_pt: Option<PageSizeOutput>,
    rotations: Vec<i64>,
}

#[derive(Debug, Serialize)]
struct PageSizeOutput {
    width: f32,
    height: f32,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging(cli.verbose);

    if let Commands::Version = cli.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = load_config(cli.config.as_deref(), cli.threads)?;
    let mut session =
        PdfSession::new(default_engine(), config).context("failed to start engine session")?;

    let result = match cli.command {
        Commands::Info { file } => run_info(&session, &file),
        Commands::RenderThumb {
            file,
            page,
            width,
            height,
            output,
        } => run_render_thumb(&session, &file, page, width, height, output.as_deref()),
        Commands::Text { file, page } => run_text(&session, &file, page),
        Commands::Rotate {
            file,
            page,
            quarter_turns,
            output,
        } => run_rotate(&session, &file, page, quarter_turns, &output),
        Commands::Version => Ok(()),
    };

    let stats = session.dispatcher().stats();
    debug!(
        submitted = stats.jobs_submitted,
        completed = stats.jobs_completed,
        failed = stats.jobs_failed,
        "engine jobs"
    );
    session.shutdown().context("failed to shut down engine session")?;

    result
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // A second init in the same process keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Resolves the dispatcher configuration.
///
/// An explicit `--config` file must exist. Otherwise the per-user file is
/// used when present. Environment variables override the file and
/// `--threads` overrides everything.
fn load_config(path: Option<&Path>, threads: Option<usize>) -> Result<DispatcherConfig> {
    let config = match path {
        Some(path) => DispatcherConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => match default_config_path().filter(|path| path.is_file()) {
            Some(path) => DispatcherConfig::from_file(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => DispatcherConfig::default(),
        },
    };

    let mut config = config.merge_env().context("invalid DOCPUMP_* environment variable")?;
    if let Some(threads) = threads {
        if threads == 0 {
            anyhow::bail!("--threads must be >= 1");
        }
        config = config.with_thread_count(threads);
    }

    debug!(?config, "dispatcher configuration");
    Ok(config)
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("docpump").join("dispatch.toml"))
}

fn run_info(session: &PdfSession<LopdfEngine>, file: &Path) -> Result<()> {
    ensure_pdf_exists(file)?;

    let document = session.open(file).context("failed to open PDF")?;
    let pages = document.pages()?;

    let first_page_size_pt = pages.first().map(|page| PageSizeOutput {
        width: page.size().width_pt,
        height: page.size().height_pt,
    });
    let rotations = pages
        .iter()
        .map(|page| Ok(page.rotation()?.degrees()))
        .collect::<Result<Vec<_>>>()?;

    let payload = InfoOutput {
        path: file.display().to_string(),
        page_count: pages.len() as u32,
        first_page_size_pt,
        rotations,
    };

    let json = serde_json::to_string_pretty(&payload)?;
    println!("{json}");

    document.close()?;

    Ok(())
}

fn run_render_thumb(
    session: &PdfSession<LopdfEngine>,
    file: &Path,
    page: u32,
    width: u32,
    height: u32,
    output: Option<&Path>,
) -> Result<()> {
    ensure_pdf_exists(file)?;
    let page_index = page_index(page)?;

    let document = session.open(file).context("failed to open PDF")?;
    let image = document
        .page(page_index)?
        .render_thumbnail(ThumbnailSize {
            width_px: width,
            height_px: height,
        })
        .context("failed to render thumbnail")?;

    let output = output
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| default_thumbnail_output(file, page));

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    image
        .save(&output)
        .with_context(|| format!("failed to write image to {}", output.display()))?;

    println!("{}", output.display());

    document.close()?;

    Ok(())
}

fn run_text(session: &PdfSession<LopdfEngine>, file: &Path, page: Option<u32>) -> Result<()> {
    ensure_pdf_exists(file)?;

    let document = session.open(file).context("failed to open PDF")?;
    let pages = match page {
        Some(page) => vec![document.page(page_index(page)?)?],
        None => document.pages()?,
    };

    for page in pages {
        let text = page
            .extract_text()
            .with_context(|| format!("failed to extract text from page {}", page.index() + 1))?;
        print!("{text}");
    }

    document.close()?;

    Ok(())
}

fn run_rotate(
    session: &PdfSession<LopdfEngine>,
    file: &Path,
    page: u32,
    quarter_turns: u8,
    output: &Path,
) -> Result<()> {
    ensure_pdf_exists(file)?;
    let rotation = Rotation::from_quarter_turns(quarter_turns)?;

    let document = session.open(file).context("failed to open PDF")?;
    document.page(page_index(page)?)?.set_rotation(rotation)?;

    if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    document
        .save(output)
        .with_context(|| format!("failed to write PDF to {}", output.display()))?;

    println!("{}", output.display());

    document.close()?;

    Ok(())
}

fn page_index(page: u32) -> Result<u32> {
    if page == 0 {
        anyhow::bail!("--page is 1-based and must be >= 1");
    }
    Ok(page - 1)
}

fn ensure_pdf_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("file does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("path is not a file: {}", path.display());
    }

    Ok(())
}

fn default_thumbnail_output(file: &Path, page: u32) -> PathBuf {
    let stem = file.file_stem().and_then(|name| name.to_str()).unwrap_or("thumbnail");

    file.with_file_name(format!("{stem}-page-{page}.png"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn page_index_is_one_based() {
        assert_eq!(page_index(1).unwrap(), 0);
        assert!(page_index(0).is_err());
    }

    #[test]
    fn thumbnail_output_sits_next_to_input() {
        let output = default_thumbnail_output(Path::new("/tmp/report.pdf"), 3);
        assert_eq!(output, PathBuf::from("/tmp/report-page-3.png"));
    }

    #[test]
    #[serial]
    fn threads_flag_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.toml");
        fs::write(&path, "thread_count = 3\nthread_name = \"cli-worker\"\n").unwrap();

        let config = load_config(Some(&path), None).unwrap();
        assert_eq!(config.thread_count, 3);
        assert_eq!(config.thread_name, "cli-worker");

        let config = load_config(Some(&path), Some(2)).unwrap();
        assert_eq!(config.thread_count, 2);
        assert!(load_config(Some(&path), Some(0)).is_err());
    }

    #[test]
    #[serial]
    fn missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("absent.toml")), None).unwrap_err();
        assert!(format!("{err:#}").contains("failed to load config"));
    }
}
