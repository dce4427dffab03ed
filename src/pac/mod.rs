//! Proxy auto-config export.
//!
//! Renders the policy table as a JavaScript PAC script whose
//! `FindProxyForURL` mirrors the engine's lookup: exact rule match first,
//! then a suffix walk bounded by the configured depth.

use crate::world::World;

impl World {
    /// Render a PAC script routing every policied host through the SOCKS
    /// proxy at `address`.
    pub fn pac(&self, address: &str) -> String {
        let mut rules = String::new();
        for host in self.policy_keys() {
            rules.push_str(&format!("\"{host}\":1,\n"));
        }
        format!(
            "var proxy = 'SOCKS {address}';\n\
             var rules = {{\n\
             {rules}}}\n\
             function FindProxyForURL(url, host) {{\n\
             \tif (rules[host] != undefined) {{\n\
             \t\treturn proxy;\n\
             \t}}\n\
             \tfor (var i = 0; i < {depth}; i++){{\n\
             \t\tvar dot = host.indexOf(\".\");\n\
             \t\tif (dot == -1) {{return 'DIRECT';}}\n\
             \t\thost = host.slice(dot);\n\
             \t\tif (rules[host] != undefined) {{return proxy;}}\n\
             \t\thost = host.slice(1);\n\
             \t}}\n\
             \treturn 'DIRECT';\n\
             }}\n",
            address = address,
            rules = rules,
            depth = self.subdomain_depth(),
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::world::World;

    #[test]
    fn script_carries_rules_and_depth() {
        let world = World::new();
        world.insert_policy("blocked.example", Config::default());
        world.insert_policy(".co.uk", Config::default());
        world.set_subdomain_depth(3);

        let script = world.pac("127.0.0.1:1080");
        assert!(script.starts_with("var proxy = 'SOCKS 127.0.0.1:1080';"));
        assert!(script.contains("\"blocked.example\":1,\n"));
        assert!(script.contains("\".co.uk\":1,\n"));
        assert!(script.contains("for (var i = 0; i < 3; i++)"));
        assert!(script.contains("function FindProxyForURL(url, host)"));
        assert!(script.ends_with("return 'DIRECT';\n}\n"));
    }

    #[test]
    fn empty_table_still_renders() {
        let world = World::new();
        let script = world.pac("10.0.0.1:1080");
        assert!(script.contains("var rules = {\n}\n"));
    }
}
