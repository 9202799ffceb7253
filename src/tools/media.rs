//! Media tools: they push a camera feed or an image to every connected
//! console, then tell the model what was shown.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use iiot_assistant_core::capability::{TOOL_SHOW_CAMERA, TOOL_SHOW_DEVICE_IMAGE};
use iiot_assistant_core::models::{MediaType, PushEvent};
use serde_json::{json, Value};
use walkdir::WalkDir;

use super::{file_url, required_str, Tool, ToolContext};

pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "gif"];

pub struct ShowCameraTool {
    url_template: String,
}

impl ShowCameraTool {
    /// `url_template` contains a `{location}` placeholder.
    pub fn new(url_template: String) -> Self {
        Self { url_template }
    }

    pub fn stream_url(&self, location: &str) -> String {
        self.url_template.replace("{location}", location)
    }
}

#[async_trait]
impl Tool for ShowCameraTool {
    fn name(&self) -> &str {
        TOOL_SHOW_CAMERA
    }

    fn description(&self) -> &str {
        "Show the live surveillance camera feed for a location on the user's screen."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "location": { "type": "string", "description": "Camera location, e.g. Workshop-A, MainGate" }
            },
            "required": ["location"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let location = required_str(&params, "location")?;
        ctx.push.broadcast(PushEvent::media(
            MediaType::Video,
            format!("Connecting to the {location} camera feed..."),
            self.stream_url(location),
        ));
        Ok(format!(
            "The {location} camera feed is now shown on the user's screen."
        ))
    }
}

pub struct ShowDeviceImageTool {
    root: PathBuf,
    mount: &'static str,
}

impl ShowDeviceImageTool {
    pub fn new(root: PathBuf, mount: &'static str) -> Self {
        Self { root, mount }
    }

    fn images(root: &Path) -> Vec<PathBuf> {
        WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && is_image(entry.path()))
            .filter_map(|entry| entry.path().strip_prefix(root).ok().map(Path::to_path_buf))
            .collect()
    }
}

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl Tool for ShowDeviceImageTool {
    fn name(&self) -> &str {
        TOOL_SHOW_DEVICE_IMAGE
    }

    fn description(&self) -> &str {
        "Find and show an architecture diagram, photo or drawing from the local image library."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "keyword": { "type": "string", "description": "Image keyword or device name" }
            },
            "required": ["keyword"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let keyword = required_str(&params, "keyword")?;
        if !self.root.is_dir() {
            return Ok("The image library directory does not exist, so no image can be shown.".into());
        }

        let root = self.root.clone();
        let images = tokio::task::spawn_blocking(move || Self::images(&root)).await?;
        if images.is_empty() {
            return Ok("The image library contains no image files.".into());
        }

        let needle = keyword.to_lowercase();
        let matched = images.iter().find(|p| {
            p.file_stem()
                .map(|s| s.to_string_lossy().to_lowercase().contains(&needle))
                .unwrap_or(false)
        });

        match matched {
            Some(path) => {
                let name = display_name(path);
                let url = file_url(&ctx.public_url, self.mount, path)?;
                ctx.push.broadcast(PushEvent::media(
                    MediaType::Image,
                    format!("Found a related image: {name}"),
                    url,
                ));
                Ok(format!(
                    "Showed the image {name} to the user. Mention in your reply that you found it."
                ))
            }
            None => {
                let available: Vec<String> = images.iter().map(|p| display_name(p)).collect();
                Ok(format!(
                    "No image matching '{}' was found. The library only contains: [{}]. Tell the user politely and list these images for them to choose from.",
                    keyword,
                    available.join(", ")
                ))
            }
        }
    }
}
