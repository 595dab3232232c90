//! Configuration generator for yomiage
//!
//! Writes a commented `config.yml` with every section at its default, filled
//! in with whatever was passed on the command line.

use clap::{Parser, ValueEnum};
use std::fs;
use std::path::PathBuf;
use yomiage_core::{ReadoutConfig, DEFAULT_CONFIG_PATH, DEFAULT_SPEAKER};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Output file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    output: PathBuf,

    /// Force overwrite if file exists
    #[arg(short, long)]
    force: bool,

    /// Discord bot token (can also be supplied later through DISCORD_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Discord application id, used for the invite link
    #[arg(long)]
    application_id: Option<u64>,

    /// Synthesis engine base URL; repeat for several engines
    #[arg(long = "endpoint")]
    endpoints: Vec<String>,

    /// How engine audio is turned into frames
    #[arg(long, value_enum, default_value = "ffmpeg")]
    transcoder: Transcoder,

    /// File persisting which voice each user was given
    #[arg(long)]
    mapping_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Transcoder {
    /// External ffmpeg process, any container
    Ffmpeg,
    /// Built-in WAV decoder, no ffmpeg needed
    Wav,
}

fn yaml_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn generate_config_content(cli: &Cli, generated: &str) -> String {
    let endpoints = if cli.endpoints.is_empty() {
        vec!["http://127.0.0.1:10101".to_string()]
    } else {
        cli.endpoints.clone()
    };
    let endpoints = endpoints
        .iter()
        .map(|e| format!("    - {}", yaml_quote(e)))
        .collect::<Vec<_>>()
        .join("\n");
    let application_id = cli
        .application_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "null".to_string());
    let transcoder = match cli.transcoder {
        Transcoder::Ffmpeg => "ffmpeg",
        Transcoder::Wav => "wav",
    };
    let mapping_file = match &cli.mapping_file {
        Some(path) => format!("  mapping_file: {}", yaml_quote(&path.display().to_string())),
        None => "  mapping_file: null".to_string(),
    };

    format!(
        "# ========================================\n\
         # yomiage - Readout Bot Configuration\n\
         # ========================================\n\
         # Generated: {generated}\n\
         #\n\
         # Environment overrides: DISCORD_TOKEN, DISCORD_APPLICATION_ID,\n\
         # YOMIAGE_TTS_ENDPOINTS, YOMIAGE_MAX_TEXT_LENGTH, YOMIAGE_QUEUE_CAPACITY,\n\
         # YOMIAGE_SYNTHESIS_TIMEOUT_MS, YOMIAGE_IDLE_GRACE_SECS\n\
         # Keep this file private once it holds a token.\n\
         \n\
         discord:\n\
         \x20 access_token: {token}\n\
         \x20 application_id: {application_id}\n\
         \n\
         readout:\n\
         \x20 # characters read from one message\n\
         \x20 max_text_length: 40\n\
         \x20 truncation_suffix: \"以下省略\"\n\
         \x20 # pending utterances per guild\n\
         \x20 queue_capacity: 8\n\
         \x20 # drop_oldest | reject_newest\n\
         \x20 overflow_policy: drop_oldest\n\
         \n\
         synthesis:\n\
         \x20 # VOICEVOX-compatible engines; requests race across all of them\n\
         \x20 endpoints:\n\
         {endpoints}\n\
         \x20 timeout_ms: 10000\n\
         \x20 default_speaker: {speaker}\n\
         \x20 interrogative_upspeak: true\n\
         \n\
         transcoder:\n\
         \x20 # ffmpeg | wav\n\
         \x20 kind: {transcoder}\n\
         \x20 ffmpeg_path: \"ffmpeg\"\n\
         \x20 frame_timeout_ms: 5000\n\
         \n\
         playback:\n\
         \x20 send_timeout_ms: 1000\n\
         \x20 prebuffer_frames: 5\n\
         \x20 teardown_timeout_ms: 3000\n\
         \n\
         session:\n\
         \x20 connect_timeout_ms: 10000\n\
         \x20 # seconds to stay in a channel with no humans left\n\
         \x20 idle_grace_secs: 5\n\
         \x20 auto_join: true\n\
         \x20 announce_presence: true\n\
         \x20 join_template: \"{{name}} さんが入室しました。\"\n\
         \x20 leave_template: \"{{name}} さんが退室しました。\"\n\
         \x20 greeting: \"読み上げを開始します。\"\n\
         \n\
         voices:\n\
         \x20 # omit catalog to use the built-in list of speakers\n\
         \x20 # catalog:\n\
         \x20 #   - {{ name: \"Anneli (ノーマル)\", id: {speaker} }}\n\
         \x20 # YAML file remembering which speaker each user got\n\
         {mapping_file}\n\
         \n\
         router:\n\
         \x20 filters:\n\
         \x20   - rule: require_guild\n\
         \x20   - rule: ignore_bots\n\
         \x20   - rule: ignore_self\n\
         \x20   - rule: require_bound_channel\n\
         \x20   - rule: ignore_prefix\n\
         \x20     prefix: \"neko!\"\n\
         \x20   - rule: require_text\n\
         \x20 text:\n\
         \x20   - rule: strip_custom_emoji\n\
         \x20   - rule: strip_emoji\n\
         \x20   - rule: replace_mentions\n\
         \x20     prefix: \"アットマーク \"\n\
         \x20   - rule: replace_urls\n\
         \x20     placeholder: \"URL\"\n\
         \x20   - rule: collapse_whitespace\n\
         \x20   - rule: truncate\n\
         \x20 attachment_text: \"添付ファイル\"\n",
        generated = generated,
        token = yaml_quote(cli.token.as_deref().unwrap_or("")),
        application_id = application_id,
        endpoints = endpoints,
        speaker = DEFAULT_SPEAKER,
        transcoder = transcoder,
        mapping_file = mapping_file,
    )
}

fn main() {
    let cli = Cli::parse();

    if cli.output.exists() && !cli.force {
        eprintln!("Error: File {:?} already exists!", cli.output);
        eprintln!("   Use --force to overwrite");
        std::process::exit(1);
    }

    let generated = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let content = generate_config_content(&cli, &generated);

    // never write a file the bot would refuse to load
    if let Err(e) = ReadoutConfig::from_yaml_str(&content).and_then(|c| c.validate()) {
        eprintln!("Error: generated configuration is invalid: {}", e);
        std::process::exit(1);
    }

    if let Some(parent) = cli.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = fs::create_dir_all(parent) {
            eprintln!("Failed to create {:?}: {}", parent, e);
            std::process::exit(1);
        }
    }
    match fs::write(&cli.output, content) {
        Ok(_) => println!("Configuration written to: {:?}", cli.output),
        Err(e) => {
            eprintln!("Failed to write file: {}", e);
            std::process::exit(1);
        }
    }

    #[cfg(unix)]
    if cli.token.is_some() {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        match fs::set_permissions(&cli.output, perms) {
            Ok(_) => println!("Set file permissions to 600 (owner only)"),
            Err(e) => eprintln!("Warning: Could not set file permissions: {}", e),
        }
    }

    println!();
    println!("Next Steps:");
    if cli.token.is_none() {
        println!("   1. Put your bot token in {:?} or DISCORD_TOKEN", cli.output);
    } else {
        println!("   1. Keep {:?} out of version control", cli.output);
    }
    println!("   2. Start AivisSpeech or another VOICEVOX-compatible engine");
    println!("   3. cargo run -p run-bot -- --config {}", cli.output.display());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("generate-config").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_template_round_trips_to_defaults() {
        let content = generate_config_content(&cli(&[]), "now");
        let parsed = ReadoutConfig::from_yaml_str(&content).unwrap();
        let defaults = ReadoutConfig::default();

        assert_eq!(parsed.router, defaults.router);
        assert_eq!(parsed.synthesis.endpoints, defaults.synthesis.endpoints);
        assert_eq!(parsed.readout.max_text_length, 40);
        assert_eq!(parsed.session.join_template, defaults.session.join_template);
        assert_eq!(parsed.voices.catalog.len(), defaults.voices.catalog.len());
        assert!(parsed.voices.mapping_file.is_none());
        parsed.validate().unwrap();
    }

    #[test]
    fn test_arguments_are_filled_in() {
        let content = generate_config_content(
            &cli(&[
                "--token",
                "abc\"def",
                "--application-id",
                "42",
                "--endpoint",
                "http://a:50021",
                "--endpoint",
                "http://b:50021",
                "--transcoder",
                "wav",
                "--mapping-file",
                "data/voices.yml",
            ]),
            "now",
        );
        let parsed = ReadoutConfig::from_yaml_str(&content).unwrap();
        assert_eq!(parsed.discord.access_token, "abc\"def");
        assert_eq!(parsed.discord.application_id, Some(42));
        assert_eq!(parsed.synthesis.endpoints, ["http://a:50021", "http://b:50021"]);
        assert_eq!(parsed.transcoder.kind, yomiage_core::TranscoderKind::Wav);
        assert_eq!(parsed.voices.mapping_file, Some(PathBuf::from("data/voices.yml")));
    }
}
