// Warden — model router.
// Pure policy over component readiness: the router owns no state, it decides
// and the executor carries the decision through the VRAM mutex or the cloud
// client.

use std::sync::Arc;

use crate::cloud::CloudClient;
use crate::error::CoreResult;
use crate::local_llm::{GenerateOptions, LocalClient};
use crate::vram::{ModelKind, VramMutex};

/// Largest prompt the local models accept before escalation.
pub const LOCAL_CONTEXT_LIMIT_CHARS: usize = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Cloud,
    LocalCoder,
    LocalVision,
}

/// Selection policy, in order: forced cloud, vision, context length, local
/// availability.
pub fn choose(
    prompt_chars: usize,
    has_images: bool,
    force_cloud: bool,
    local_available: bool,
) -> RouteTarget {
    if force_cloud {
        return RouteTarget::Cloud;
    }
    if has_images {
        return RouteTarget::LocalVision;
    }
    if prompt_chars > LOCAL_CONTEXT_LIMIT_CHARS {
        return RouteTarget::Cloud;
    }
    if local_available {
        return RouteTarget::LocalCoder;
    }
    RouteTarget::Cloud
}

pub struct ModelRouter {
    local: Arc<LocalClient>,
    cloud: Arc<CloudClient>,
    vram: Arc<VramMutex>,
}

impl ModelRouter {
    pub fn new(local: Arc<LocalClient>, cloud: Arc<CloudClient>, vram: Arc<VramMutex>) -> Self {
        Self { local, cloud, vram }
    }

    pub async fn route(
        &self,
        prompt: &str,
        system: Option<&str>,
        images: Option<&[String]>,
        force_cloud: bool,
    ) -> CoreResult<String> {
        let has_images = images.is_some_and(|i| !i.is_empty());
        let prompt_chars = prompt.chars().count();
        if prompt_chars > LOCAL_CONTEXT_LIMIT_CHARS {
            tracing::info!(
                "router: prompt length {} > {} — escalating to cloud",
                prompt_chars,
                LOCAL_CONTEXT_LIMIT_CHARS
            );
        }

        let target = choose(
            prompt_chars,
            has_images,
            force_cloud,
            self.local_ready(force_cloud, has_images, prompt_chars).await,
        );

        match target {
            RouteTarget::Cloud => self.cloud.generate(prompt, system).await,
            RouteTarget::LocalVision => self.call_local(ModelKind::Vision, prompt, system, images).await,
            RouteTarget::LocalCoder => {
                match self.call_local(ModelKind::Coder, prompt, system, None).await {
                    Ok(text) => Ok(text),
                    Err(e) => {
                        tracing::warn!("router: local model failed ({}) — falling back to cloud", e);
                        self.cloud.generate(prompt, system).await
                    }
                }
            }
        }
    }

    // The availability probe is only worth a round-trip when the decision can
    // still go local.
    async fn local_ready(&self, force_cloud: bool, has_images: bool, prompt_chars: usize) -> bool {
        if force_cloud || has_images || prompt_chars > LOCAL_CONTEXT_LIMIT_CHARS {
            return false;
        }
        self.local.is_available().await
    }

    async fn call_local(
        &self,
        kind: ModelKind,
        prompt: &str,
        system: Option<&str>,
        images: Option<&[String]>,
    ) -> CoreResult<String> {
        let guard = self.vram.acquire(kind).await?;
        let opts = GenerateOptions {
            system: system.map(str::to_string),
            images: images.map(|i| i.to_vec()),
            ..GenerateOptions::default()
        };
        let result = self.local.generate(guard.model(), prompt, &opts).await;
        drop(guard);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_cloud_wins_over_everything() {
        assert_eq!(choose(10, true, true, true), RouteTarget::Cloud);
    }

    #[test]
    fn images_go_to_local_vision() {
        assert_eq!(choose(10, true, false, true), RouteTarget::LocalVision);
        // Vision routing does not consult availability.
        assert_eq!(choose(10, true, false, false), RouteTarget::LocalVision);
    }

    #[test]
    fn long_prompts_escalate_to_cloud() {
        assert_eq!(
            choose(LOCAL_CONTEXT_LIMIT_CHARS + 1, false, false, true),
            RouteTarget::Cloud
        );
        assert_eq!(
            choose(LOCAL_CONTEXT_LIMIT_CHARS, false, false, true),
            RouteTarget::LocalCoder
        );
    }

    #[test]
    fn unavailable_local_falls_back_to_cloud() {
        assert_eq!(choose(10, false, false, false), RouteTarget::Cloud);
    }
}
