use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the render server (HTTP + WebSocket)
    Serve {
        /// Address to bind, overrides the configuration
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Render captions onto a source in this process
    Render {
        /// Source media: URL, file:// URL or local path
        #[arg(short, long)]
        source: String,

        /// Word-level transcript (JSON array of words)
        #[arg(short, long)]
        words: PathBuf,

        /// Name used for the published file
        #[arg(long, default_value = "local")]
        id: String,
    },

    /// Start a render on a server and follow its progress
    Submit {
        /// Project id
        id: String,

        /// Server base URL, overrides the configuration
        #[arg(long)]
        server: Option<String>,
    },

    /// Convert a word-level transcript into a caption track
    Segment {
        /// Word-level transcript (JSON array of words)
        #[arg(short, long)]
        words: PathBuf,

        /// Output caption file, stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the resolved ffmpeg/ffprobe and optionally probe a file
    Probe {
        /// Media file to inspect
        input: Option<PathBuf>,
    },

    /// Ask a server whether a project's render completed
    Complete {
        /// Project id
        id: String,

        /// Server base URL, overrides the configuration
        #[arg(long)]
        server: Option<String>,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Write the default configuration
    Init {
        #[arg(short, long, default_value = "lyric-render.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_render() {
        let args = Args::try_parse_from([
            "lyric-render",
            "-v",
            "render",
            "--source",
            "song.mp3",
            "--words",
            "words.json",
        ])
        .unwrap();

        assert!(args.verbose);
        match args.command {
            Commands::Render { source, words, id } => {
                assert_eq!(source, "song.mp3");
                assert_eq!(words, PathBuf::from("words.json"));
                assert_eq!(id, "local");
            }
            _ => panic!("expected render"),
        }
    }

    #[test]
    fn test_parse_config_init() {
        let args = Args::try_parse_from(["lyric-render", "config", "init", "--force"]).unwrap();
        match args.command {
            Commands::Config {
                action: ConfigAction::Init { path, force },
            } => {
                assert_eq!(path, PathBuf::from("lyric-render.toml"));
                assert!(force);
            }
            _ => panic!("expected config init"),
        }
    }

    #[test]
    fn test_submit_requires_id() {
        assert!(Args::try_parse_from(["lyric-render", "submit"]).is_err());
    }
}
