//! Non-collaborative UI state persisted alongside the scene.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The app-state subset written to `app-state-blob`.
///
/// Only the fields the engine itself reads are typed. Everything else the
/// host stores is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStateSubset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_background_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AppStateSubset {
    /// Overlay the fields set in `other` onto `self`.
    ///
    /// Used when an external scene ships its own app state: the scene's
    /// values win, local-only values (like `username`) survive.
    pub fn overlay(&mut self, other: &AppStateSubset) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field.clone();
                })*
            };
        }
        take!(username, theme, view_background_color, zoom, scroll_x, scroll_y, name);
        for (key, value) in &other.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_fields_preserved() {
        let json = r#"{"theme":"dark","scrollX":12.5,"gridSize":20,"openMenu":null}"#;
        let state: AppStateSubset = serde_json::from_str(json).unwrap();

        assert_eq!(state.theme.as_deref(), Some("dark"));
        assert_eq!(state.scroll_x, Some(12.5));
        assert_eq!(state.extra["gridSize"], 20);

        let back = serde_json::to_value(&state).unwrap();
        assert_eq!(back["gridSize"], 20);
        assert!(back.get("username").is_none());
    }

    #[test]
    fn test_overlay_keeps_unset_fields() {
        let mut local = AppStateSubset {
            username: Some("ada".into()),
            theme: Some("light".into()),
            ..Default::default()
        };
        let scene = AppStateSubset {
            theme: Some("dark".into()),
            view_background_color: Some("#fff".into()),
            ..Default::default()
        };

        local.overlay(&scene);
        assert_eq!(local.username.as_deref(), Some("ada"));
        assert_eq!(local.theme.as_deref(), Some("dark"));
        assert_eq!(local.view_background_color.as_deref(), Some("#fff"));
    }
}
