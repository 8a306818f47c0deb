use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use exatex::{ContainerLayout, Texture};
use image::{ImageFormat, RgbaImage};
use std::{
    collections::{hash_map::Entry, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::mpsc::{self, RecvTimeoutError},
    time::{Duration, Instant},
};

/// Resolution of the decode progress bar
const PROGRESS_STEPS: u64 = 1000;
/// How often the progress bar polls a running decode
const PROGRESS_INTERVAL: Duration = Duration::from_micros(1_000_000 / 60);

#[derive(Parser, Debug)]
#[command(about = "Decode EXAPUNKS .tex textures", version)]
struct Arguments {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Convert textures to PNG images
    Convert {
        #[arg(required = true)]
        textures: Vec<PathBuf>,

        #[command(flatten)]
        layout: LayoutArgs,

        #[command(flatten)]
        args: ConvertArgs,
    },

    /// Decode a single texture while showing the decode progress
    View {
        texture: PathBuf,

        #[command(flatten)]
        layout: LayoutArgs,

        #[command(flatten)]
        args: ViewArgs,
    },

    /// Print the container header of textures
    Info {
        #[arg(required = true)]
        textures: Vec<PathBuf>,

        #[command(flatten)]
        layout: LayoutArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct LayoutArgs {
    /// Supply a custom container layout that provides the header and payload offsets
    #[arg(short = 'l', long)]
    layout: Option<PathBuf>,
}

impl Commands {
    fn get_layout(&self) -> anyhow::Result<ContainerLayout> {
        let args = match self {
            Commands::Convert { layout, .. } => layout,
            Commands::View { layout, .. } => layout,
            Commands::Info { layout, .. } => layout,
        };

        match &args.layout {
            Some(path) => ContainerLayout::open(path)
                .with_context(|| format!("Failed to load layout from {}", path.display())),
            None => Ok(ContainerLayout::default()),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Arguments::parse();
    colog::init();

    let layout = args.command.get_layout()?;
    log::debug!("Using container layout '{}'", layout.name);

    match &args.command {
        Commands::Convert { textures, args, .. } => convert(textures, &layout, args)?,
        Commands::View { texture, args, .. } => view(texture, &layout, args)?,
        Commands::Info { textures, .. } => info(textures, &layout)?,
    }

    Ok(())
}

#[derive(Args, Debug, Clone)]
struct ConvertArgs {
    /// Write the PNG images into this directory instead of next to the textures
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// Keep the premultiplied alpha of the texture instead of writing straight alpha
    #[arg(long)]
    keep_premultiplied: bool,
}

fn convert(
    textures: &[PathBuf],
    layout: &ContainerLayout,
    args: &ConvertArgs,
) -> anyhow::Result<()> {
    use indicatif::{ParallelProgressIterator, ProgressBar};
    use rayon::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    log::info!("Converting {} textures...", textures.len());

    if let Some(out_dir) = &args.out_dir {
        fs::create_dir_all(out_dir).with_context(|| "Failed to create output directory")?;
    }

    let outputs = output_paths(textures, layout, args.out_dir.as_deref());

    let progress = ProgressBar::new(textures.len() as u64);
    let failed = AtomicUsize::new(0);

    textures
        .par_iter()
        .zip(&outputs)
        .progress_with(progress.clone())
        .for_each(|(path, output)| {
            let output = match output {
                Ok(output) => output,
                Err(claimed_by) => {
                    failed.fetch_add(1, Ordering::SeqCst);
                    progress.println(format!(
                        "Skipping {}: its PNG would overwrite the one of {}",
                        path.display(),
                        claimed_by.display()
                    ));
                    return;
                }
            };

            if !layout.is_texture_path(path) {
                progress.println(format!(
                    "{} does not have a .{} extension, trying anyway",
                    path.display(),
                    layout.extension
                ));
            }

            match convert_texture(path, output, layout, args.keep_premultiplied) {
                Ok(()) => progress.println(format!(
                    "Converted {} to {}",
                    path.display(),
                    output.display()
                )),
                Err(err) => {
                    failed.fetch_add(1, Ordering::SeqCst);
                    progress.println(format!("{:#}", err));
                }
            }
        });

    progress.finish_and_clear();

    let failed = failed.load(Ordering::SeqCst);
    if failed > 0 {
        log::warn!(
            "Done! {} of {} textures could not be converted",
            failed,
            textures.len()
        );
    } else {
        log::info!("Done!");
    }

    Ok(())
}

/// Picks the PNG path of every texture. A texture whose PNG path was already picked for an earlier
/// one gets `Err` with the path of that texture instead.
fn output_paths<'a>(
    textures: &'a [PathBuf],
    layout: &ContainerLayout,
    out_dir: Option<&Path>,
) -> Vec<Result<PathBuf, &'a Path>> {
    let mut claimed = HashMap::new();

    textures
        .iter()
        .map(|path| {
            let output = match out_dir {
                Some(out_dir) => out_dir.join(format!("{}.png", layout.texture_name(path))),
                None => path.with_extension("png"),
            };

            match claimed.entry(output.clone()) {
                Entry::Occupied(entry) => Err(*entry.get()),
                Entry::Vacant(entry) => {
                    entry.insert(path.as_path());
                    Ok(output)
                }
            }
        })
        .collect()
}

fn convert_texture(
    path: &Path,
    output: &Path,
    layout: &ContainerLayout,
    keep_premultiplied: bool,
) -> anyhow::Result<()> {
    let texture = Texture::open(path, layout)
        .with_context(|| format!("Could not load texture at {}", path.display()))?;

    let image = texture
        .decode()
        .with_context(|| format!("Could not decode texture at {}", path.display()))?
        .with_context(|| format!("Decoding of {} was cancelled", path.display()))?;

    save_png(&image, output, keep_premultiplied)
}

#[derive(Args, Debug, Clone)]
struct ViewArgs {
    /// Cancel the decode if it takes longer than this many seconds
    #[arg(short, long)]
    timeout: Option<f64>,

    /// Save the decoded texture as a PNG image
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Keep the premultiplied alpha of the texture instead of writing straight alpha
    #[arg(long)]
    keep_premultiplied: bool,
}

fn view(path: &Path, layout: &ContainerLayout, args: &ViewArgs) -> anyhow::Result<()> {
    use indicatif::ProgressBar;

    let texture = Texture::open(path, layout)
        .with_context(|| format!("Could not load texture at {}", path.display()))?;
    log::info!("{} with CRC: {:#010x}", texture.title(), texture.crc());

    let timeout = args
        .timeout
        .map(Duration::try_from_secs_f64)
        .transpose()
        .with_context(|| "Invalid timeout")?;

    let (result_tx, result_rx) = mpsc::channel();
    let worker = texture.decode_async(move |result| {
        // the receiver only goes away if the main thread already bailed out
        let _ = result_tx.send(result);
    });

    let progress = ProgressBar::new(PROGRESS_STEPS);
    let started = Instant::now();
    let mut cancelled = false;

    let result = loop {
        progress.set_position((texture.progress() * PROGRESS_STEPS as f64) as u64);

        match result_rx.recv_timeout(PROGRESS_INTERVAL) {
            Ok(result) => break result,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                anyhow::bail!("Decoder stopped without reporting a result")
            }
        }

        if !cancelled && timeout.is_some_and(|timeout| started.elapsed() >= timeout) {
            log::warn!("Decoding is taking too long, cancelling...");
            texture.cancel();
            cancelled = true;
        }
    };

    if let Some(worker) = worker {
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("Decoder thread panicked"))?;
    }
    progress.finish_and_clear();

    let image = match result
        .with_context(|| format!("Could not decode texture at {}", path.display()))?
    {
        Some(image) => image,
        None => {
            log::warn!("Decoding of {} was cancelled", texture.title());
            return Ok(());
        }
    };

    log::info!("Decoded {} in {:.2?}", texture.title(), started.elapsed());

    if let Some(output) = &args.output {
        save_png(&image, output, args.keep_premultiplied)?;
        log::info!("Saved texture to {}", output.display());
    }

    Ok(())
}

fn info(textures: &[PathBuf], layout: &ContainerLayout) -> anyhow::Result<()> {
    let mut failed = 0;

    for path in textures {
        match Texture::open(path, layout) {
            Ok(texture) => log::info!(
                "{}: {} payload bytes, CRC: {:#010x}",
                texture.title(),
                texture.payload_len(),
                texture.crc()
            ),
            Err(err) => {
                failed += 1;
                log::error!("Could not load texture at {}: {}", path.display(), err);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} textures could not be loaded", failed, textures.len());
    }

    Ok(())
}

fn save_png(image: &RgbaImage, path: &Path, keep_premultiplied: bool) -> anyhow::Result<()> {
    let result = if keep_premultiplied {
        image.save_with_format(path, ImageFormat::Png)
    } else {
        let mut straight = image.clone();
        exatex::unpremultiply(&mut straight);
        straight.save_with_format(path, ImageFormat::Png)
    };

    result.with_context(|| format!("Could not save texture to {}", path.display()))
}
