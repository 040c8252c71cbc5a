use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "proxy-tunnel")]
#[command(author, version, about = "Local SOCKS5/HTTP proxy with rule-based upstream routing", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 输出详细日志（-v info，-vv debug，-vvv trace）
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// 日志级别 (trace, debug, info, warn, error)，优先于 -v
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,
}

impl Cli {
    /// 最终生效的日志过滤表达式
    pub fn log_filter(&self) -> String {
        if let Some(level) = &self.log_level {
            return level.clone();
        }
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
        .to_string()
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行代理服务
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "proxy.toml")]
        config: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long, default_value = "proxy.toml")]
        config: String,

        /// 输出格式 (text, json)
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成示例配置
    Template {
        /// 输出文件路径，缺省输出到标准输出
        #[arg(short, long)]
        output: Option<String>,
    },
}
