use std::io::{self, BufRead, Write};

use tracing::{info, warn};

use crate::client::Catalog;

pub const SEGMENTATION: &str = "segmentation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub name: String,
    pub model_type: String,
}

/// What an interactive chooser returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub model: String,
    pub tile_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub name: String,
    pub tile_size: u32,
}

/// Picks one model when the catalog offers several. `tile_size` is `Some`
/// (the current default) only when a whole-slide tile size may be overridden.
/// `Ok(None)` means the user cancelled.
pub trait ModelChooser {
    fn choose(&mut self, names: &[String], tile_size: Option<u32>) -> io::Result<Option<Choice>>;
}

pub fn segmentation_models(catalog: &Catalog) -> Vec<ModelDescriptor> {
    catalog
        .models
        .iter()
        .inspect(|(name, model)| info!(model = %name, kind = %model.model_type, "catalog entry"))
        .filter(|(_, model)| model.model_type.eq_ignore_ascii_case(SEGMENTATION))
        .map(|(name, model)| ModelDescriptor {
            name: name.clone(),
            model_type: model.model_type.clone(),
        })
        .collect()
}

/// Resolve the model to run. A single eligible model is taken without asking
/// the chooser. The tile size is only overridable in whole-slide mode.
pub fn resolve_model(
    catalog: &Catalog,
    chooser: &mut dyn ModelChooser,
    whole_slide: bool,
    default_tile_size: u32,
) -> io::Result<Option<ModelSelection>> {
    let names: Vec<String> = segmentation_models(catalog)
        .into_iter()
        .map(|m| m.name)
        .collect();

    let (name, tile_size) = match names.len() {
        0 => {
            info!("no segmentation models available");
            return Ok(None);
        }
        1 => (names[0].clone(), default_tile_size),
        _ => {
            let offered_tile = whole_slide.then_some(default_tile_size);
            let choice = match chooser.choose(&names, offered_tile)? {
                Some(choice) => choice,
                None => {
                    info!("model selection cancelled");
                    return Ok(None);
                }
            };
            let tile_size = if whole_slide {
                match choice.tile_size {
                    Some(0) => {
                        warn!("ignoring zero tile size, using {default_tile_size}");
                        default_tile_size
                    }
                    Some(t) => t,
                    None => default_tile_size,
                }
            } else {
                default_tile_size
            };
            (choice.model, tile_size)
        }
    };

    if name.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(ModelSelection { name, tile_size }))
}

/// Non-interactive chooser fed from command-line flags.
#[derive(Debug, Clone, Default)]
pub struct PresetChooser {
    pub model: Option<String>,
    pub tile_size: Option<u32>,
}

impl ModelChooser for PresetChooser {
    fn choose(&mut self, names: &[String], tile_size: Option<u32>) -> io::Result<Option<Choice>> {
        let Some(model) = self.model.as_deref().map(str::trim) else {
            warn!(
                available = %names.join(", "),
                "several segmentation models available; pass --model to pick one"
            );
            return Ok(None);
        };
        if !names.iter().any(|n| n == model) {
            warn!(model, available = %names.join(", "), "requested model is not offered");
            return Ok(None);
        }
        Ok(Some(Choice {
            model: model.to_string(),
            tile_size: tile_size.and(self.tile_size),
        }))
    }
}

/// Line-based prompt. An empty answer cancels.
pub struct PromptChooser<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptChooser<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn ask(&mut self, prompt: &str) -> io::Result<String> {
        write!(self.output, "{prompt}")?;
        self.output.flush()?;
        let mut line = String::new();
        self.input.read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

impl<R: BufRead, W: Write> ModelChooser for PromptChooser<R, W> {
    fn choose(&mut self, names: &[String], tile_size: Option<u32>) -> io::Result<Option<Choice>> {
        writeln!(self.output, "Segmentation models:")?;
        for (idx, name) in names.iter().enumerate() {
            writeln!(self.output, "  {}) {name}", idx + 1)?;
        }
        let answer = self.ask(&format!("Model [1-{}, empty to cancel]: ", names.len()))?;
        if answer.is_empty() {
            return Ok(None);
        }
        let model = match answer.parse::<usize>() {
            Ok(n) if (1..=names.len()).contains(&n) => names[n - 1].clone(),
            _ => match names.iter().find(|n| **n == answer) {
                Some(name) => name.clone(),
                None => {
                    writeln!(self.output, "unknown model: {answer}")?;
                    return Ok(None);
                }
            },
        };

        let tile_size = match tile_size {
            Some(default) => {
                let raw = self.ask(&format!("TileSize [{default}]: "))?;
                if raw.is_empty() {
                    Some(default)
                } else {
                    match raw.parse::<u32>() {
                        Ok(t) => Some(t),
                        Err(_) => {
                            writeln!(self.output, "invalid tile size: {raw}")?;
                            return Ok(None);
                        }
                    }
                }
            }
            None => None,
        };

        Ok(Some(Choice { model, tile_size }))
    }
}
