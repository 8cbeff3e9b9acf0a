//! Message tool: send text and media to the user mid-turn.
//!
//! Messages go onto the invocation's outbound sender and are delivered
//! best-effort. Inline base64 attachments are written to the media directory
//! first so channels only ever deal with file paths.

use crate::registry::{Tool, ToolContext, ToolResult};
use base64::Engine;
use nanoclaw_core::{ChannelIdentity, OutboundMessage};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

pub struct MessageTool {
    media_dir: PathBuf,
}

impl MessageTool {
    pub fn new(media_dir: impl Into<PathBuf>) -> Self {
        Self {
            media_dir: media_dir.into(),
        }
    }

    fn save_base64(
        &self,
        data: &str,
        file_name: Option<&str>,
        mime_type: Option<&str>,
        default_mime: &str,
        prefix: &str,
    ) -> Result<PathBuf, String> {
        let (payload, uri_mime) = split_data_uri(data);
        let raw = base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| e.to_string())?;

        let mime = uri_mime.or(mime_type).unwrap_or(default_mime);
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S_%f");

        let name = file_name
            .and_then(|n| Path::new(n).file_name())
            .and_then(|n| n.to_str())
            .map(String::from)
            .unwrap_or_else(|| format!("{}_{}{}", prefix, stamp, extension_for(mime)));

        std::fs::create_dir_all(&self.media_dir).map_err(|e| e.to_string())?;
        let path = self.media_dir.join(name);
        std::fs::write(&path, raw).map_err(|e| e.to_string())?;
        Ok(path)
    }
}

/// Split `data:<mime>;base64,<payload>` into payload and mime.
fn split_data_uri(data: &str) -> (&str, Option<&str>) {
    if let Some(rest) = data.strip_prefix("data:") {
        if let Some((header, payload)) = rest.split_once(',') {
            let mime = header
                .strip_suffix(";base64")
                .filter(|m| !m.is_empty());
            return (payload, mime);
        }
    }
    (data, None)
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => ".png",
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "application/pdf" => ".pdf",
        "text/plain" => ".txt",
        "application/json" => ".json",
        _ => ".bin",
    }
}

fn str_arg<'a>(args: &'a Value, name: &str) -> Option<&'a str> {
    args[name].as_str().filter(|s| !s.is_empty())
}

#[async_trait::async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to the user. Use this when you want to communicate something, \
         send local pictures or local files to the user."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "The message content to send" },
                "media": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Optional local file paths for media to send"
                },
                "image_path": { "type": "string", "description": "Optional local image path" },
                "image_base64": { "type": "string", "description": "Optional base64 image data or data URI" },
                "image_mime_type": { "type": "string", "description": "Mime type for image_base64 (default: image/png)" },
                "file_path": { "type": "string", "description": "Optional local file path" },
                "file_base64": { "type": "string", "description": "Optional base64 file data or data URI" },
                "file_name": { "type": "string", "description": "Filename for file_base64" },
                "file_mime_type": { "type": "string", "description": "Mime type for file_base64" },
                "title": { "type": "string", "description": "Optional title for rich media messages" },
                "channel": { "type": "string", "description": "Target channel; defaults to the current one" },
                "chat_id": { "type": "string", "description": "Target chat id; defaults to the current one" }
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let outbound = match &ctx.outbound {
            Some(tx) => tx,
            None => return ToolResult::error("Message sending not configured"),
        };

        let identity = ChannelIdentity::new(
            str_arg(&args, "channel").unwrap_or(&ctx.identity.channel),
            str_arg(&args, "chat_id").unwrap_or(&ctx.identity.chat_id),
        );

        let mut media: Vec<String> = args["media"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        if let Some(p) = str_arg(&args, "image_path") {
            media.push(p.to_string());
        }
        if let Some(data) = str_arg(&args, "image_base64") {
            match self.save_base64(
                data,
                None,
                str_arg(&args, "image_mime_type"),
                "image/png",
                "outbound",
            ) {
                Ok(path) => media.push(path.display().to_string()),
                Err(e) => return ToolResult::error(format!("failed to save base64 image: {}", e)),
            }
        }
        if let Some(p) = str_arg(&args, "file_path") {
            media.push(p.to_string());
        }
        if let Some(data) = str_arg(&args, "file_base64") {
            match self.save_base64(
                data,
                str_arg(&args, "file_name"),
                str_arg(&args, "file_mime_type"),
                "application/octet-stream",
                "file",
            ) {
                Ok(path) => media.push(path.display().to_string()),
                Err(e) => return ToolResult::error(format!("failed to save base64 file: {}", e)),
            }
        }

        let content = str_arg(&args, "content").unwrap_or_default().to_string();
        if content.is_empty() && media.is_empty() {
            return ToolResult::error("No content or media provided");
        }

        let target = identity.to_string();
        let msg = OutboundMessage {
            identity,
            text: content,
            media,
            title: str_arg(&args, "title").map(String::from),
        };

        match outbound.send(msg).await {
            Ok(()) => ToolResult::text(format!("Message sent to {}", target)),
            Err(e) => ToolResult::error(format!("sending message: {}", e)),
        }
    }
}
