use crate::core::state::{Speaker, NARRATOR_ID};

pub const NARRATOR_VOICE: &str = "sage";
pub const FALLBACK_VOICE: &str = "alloy";

/// Static roster lookup on (gender, age group). Missing gender counts as
/// "unknown", missing age as "adult".
pub fn voice_for(gender: &str, age_group: &str) -> &'static str {
    let gender = if gender.is_empty() { "unknown" } else { gender };
    let age_group = if age_group.is_empty() { "adult" } else { age_group };
    match (gender.to_lowercase().as_str(), age_group.to_lowercase().as_str()) {
        ("male", "child") | ("male", "teen") => "verse",
        ("male", "adult") => "echo",
        ("male", "elder") => "onyx",
        ("female", "child") | ("female", "teen") => "coral",
        ("female", "adult") => "nova",
        ("female", "elder") => "shimmer",
        _ => FALLBACK_VOICE,
    }
}

/// Overwrites every speaker's voice. The narrator always gets the narrator voice.
pub fn assign_voices(speakers: &mut [Speaker]) {
    for speaker in speakers.iter_mut() {
        speaker.voice_id = if speaker.speaker_id == NARRATOR_ID {
            NARRATOR_VOICE.to_string()
        } else {
            voice_for(&speaker.gender, &speaker.age_group).to_string()
        };
    }
}

/// Voice for a bubble's speaker, falling back when the speaker is unknown or
/// has no voice yet.
pub fn resolve_voice<'a>(speakers: &'a [Speaker], speaker_id: Option<&str>) -> &'a str {
    speaker_id
        .and_then(|id| speakers.iter().find(|s| s.speaker_id == id))
        .map(|s| s.voice_id.as_str())
        .filter(|v| !v.is_empty())
        .unwrap_or(FALLBACK_VOICE)
}
