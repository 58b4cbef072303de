use {super::*, options::Options};

/// Bundled fallback server list, in the spirit of Electrum's own
/// `servers.json` bootstrap list: used only when `--servers` is not given.
const DEFAULT_SERVERS: &[&str] = &[
    "electrum.blockstream.info:50002:s",
    "fortress.qtornado.com:50002:s",
    "electrum.emzy.de:50002:s",
];

#[derive(Clone, Debug)]
pub(crate) struct Settings {
    pub(crate) data_dir: PathBuf,
    pub(crate) cert_dir: PathBuf,
    pub(crate) servers: Vec<ServerAddr>,
    pub(crate) proxy: Option<ProxyConfig>,
    pub(crate) max_frame_size: usize,
}

impl Settings {
    pub(crate) fn load(options: Options) -> Result<Self> {
        let data_dir = options
            .data_dir
            .or_else(|| dirs::data_dir().map(|dir| dir.join("peernet")))
            .ok_or_else(|| anyhow!("could not determine a data directory; pass --data-dir explicitly"))?;

        let cert_dir = data_dir.join("certs");

        let servers = match options.servers {
            Some(list) => list
                .iter()
                .map(|s| {
                    ServerAddr::from_str_with_inference(s).ok_or_else(|| anyhow!("invalid server address: {s}"))
                })
                .collect::<Result<Vec<_>>>()?,
            None => DEFAULT_SERVERS
                .iter()
                .map(|s| ServerAddr::from_str(s).expect("default server addresses are well-formed"))
                .collect(),
        };
        ensure!(!servers.is_empty(), "at least one server must be configured");

        let proxy = options
            .proxy
            .map(|raw| {
                let (host, port) = raw
                    .rsplit_once(':')
                    .ok_or_else(|| anyhow!("proxy must be host:port, got {raw:?}"))?;
                let port: u16 = port.parse().context("invalid proxy port")?;
                Ok::<_, Error>(ProxyConfig { host: host.to_string(), port })
            })
            .transpose()?;

        ensure!(
            options.max_frame_size > 500_000,
            "max-frame-size must exceed 500000 bytes, got {}",
            options.max_frame_size
        );

        Ok(Self {
            data_dir,
            cert_dir,
            servers,
            proxy,
            max_frame_size: options.max_frame_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_options() -> Options {
        Options {
            data_dir: Some(PathBuf::from("/tmp/peernet-test")),
            proxy: None,
            servers: None,
            max_frame_size: 1_000_000,
        }
    }

    #[test]
    fn loads_bootstrap_servers_by_default() {
        let settings = Settings::load(base_options()).unwrap();
        assert_eq!(settings.servers.len(), DEFAULT_SERVERS.len());
    }

    #[test]
    fn rejects_small_frame_size() {
        let mut options = base_options();
        options.max_frame_size = 1_000;
        assert!(Settings::load(options).is_err());
    }

    #[test]
    fn rejects_invalid_server() {
        let mut options = base_options();
        options.servers = Some(vec!["not a server".into()]);
        assert!(Settings::load(options).is_err());
    }

    #[test]
    fn parses_proxy_host_port() {
        let mut options = base_options();
        options.proxy = Some("127.0.0.1:9050".into());
        let settings = Settings::load(options).unwrap();
        let proxy = settings.proxy.unwrap();
        assert_eq!(proxy.host, "127.0.0.1");
        assert_eq!(proxy.port, 9050);
    }
}
