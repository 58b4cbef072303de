use super::*;

#[derive(Clone, Default, Debug, Parser)]
pub(crate) struct Options {
    #[arg(long, help = "Store certificate cache under <DATA_DIR>. [default: platform data dir]")]
    pub(crate) data_dir: Option<PathBuf>,

    #[arg(long, help = "Connect through a SOCKS5 proxy at <PROXY> (host:port).")]
    pub(crate) proxy: Option<String>,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Connect to <SERVERS> instead of the built-in bootstrap list (host:port:protocol, comma separated)."
    )]
    pub(crate) servers: Option<Vec<String>>,

    #[arg(
        long,
        default_value_t = 1_000_000,
        help = "Reject incoming frames larger than <MAX_FRAME_SIZE> bytes."
    )]
    pub(crate) max_frame_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let opts = Options::default();
        assert!(opts.data_dir.is_none());
        assert!(opts.servers.is_none());
        assert_eq!(opts.max_frame_size, 0);
    }

    #[test]
    fn servers_are_comma_split() {
        let opts = Options::try_parse_from(["peernet", "--servers", "a:50002:s,b:50001:t"]).unwrap();
        assert_eq!(opts.servers.unwrap(), vec!["a:50002:s", "b:50001:t"]);
    }
}
