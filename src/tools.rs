//! Generation tools that can be metered by the credit core.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolId {
    ArchitecturalRendering,
    InteriorRendering,
    FloorPlan,
    Renovation,
    UrbanPlanning,
    LandscapeRendering,
    AiTechnicalDrawings,
    SketchConverter,
    FengShui,
    LuBanRuler,
    ViewSync,
    VirtualTour,
    PromptSuggester,
    PromptEnhancer,
    MaterialSwap,
    Staging,
    Upscale,
    Moodboard,
    VideoGeneration,
    ImageEditing,
}

impl ToolId {
    pub const ALL: [ToolId; 20] = [
        Self::ArchitecturalRendering,
        Self::InteriorRendering,
        Self::FloorPlan,
        Self::Renovation,
        Self::UrbanPlanning,
        Self::LandscapeRendering,
        Self::AiTechnicalDrawings,
        Self::SketchConverter,
        Self::FengShui,
        Self::LuBanRuler,
        Self::ViewSync,
        Self::VirtualTour,
        Self::PromptSuggester,
        Self::PromptEnhancer,
        Self::MaterialSwap,
        Self::Staging,
        Self::Upscale,
        Self::Moodboard,
        Self::VideoGeneration,
        Self::ImageEditing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ArchitecturalRendering => "architectural_rendering",
            Self::InteriorRendering => "interior_rendering",
            Self::FloorPlan => "floor_plan",
            Self::Renovation => "renovation",
            Self::UrbanPlanning => "urban_planning",
            Self::LandscapeRendering => "landscape_rendering",
            Self::AiTechnicalDrawings => "ai_technical_drawings",
            Self::SketchConverter => "sketch_converter",
            Self::FengShui => "feng_shui",
            Self::LuBanRuler => "lu_ban_ruler",
            Self::ViewSync => "view_sync",
            Self::VirtualTour => "virtual_tour",
            Self::PromptSuggester => "prompt_suggester",
            Self::PromptEnhancer => "prompt_enhancer",
            Self::MaterialSwap => "material_swap",
            Self::Staging => "staging",
            Self::Upscale => "upscale",
            Self::Moodboard => "moodboard",
            Self::VideoGeneration => "video_generation",
            Self::ImageEditing => "image_editing",
        }
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolId {
    type Err = CoreError;

    /// Accepts the snake_case id in any case, with `-` or `_` separators.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|tool| tool.as_str() == normalized)
            .ok_or_else(|| CoreError::UnknownTool(s.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_parse_back() {
        let ids: HashSet<_> = ToolId::ALL.iter().map(|t| t.as_str()).collect();
        assert_eq!(ids.len(), ToolId::ALL.len());
        for tool in ToolId::ALL {
            assert_eq!(tool.as_str().parse::<ToolId>().unwrap(), tool);
        }
    }

    #[test]
    fn parsing_is_lenient_about_case_and_dashes() {
        assert_eq!("Floor-Plan".parse::<ToolId>().unwrap(), ToolId::FloorPlan);
        assert_eq!(" upscale ".parse::<ToolId>().unwrap(), ToolId::Upscale);
    }

    #[test]
    fn unknown_tool_is_rejected() {
        let err = "teleporter".parse::<ToolId>().unwrap_err();
        assert!(matches!(err, CoreError::UnknownTool(ref t) if t == "teleporter"));
    }

    #[test]
    fn serde_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&ToolId::LuBanRuler).unwrap(),
            "\"lu_ban_ruler\""
        );
    }
}
