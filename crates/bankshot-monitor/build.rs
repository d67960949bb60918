fn main() {
    #[cfg(feature = "ebpf")]
    ebpf::generate_skeleton();
}

#[cfg(feature = "ebpf")]
mod ebpf {
    use std::path::PathBuf;

    pub fn generate_skeleton() {
        let out = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR not set"))
            .join("port_monitor.skel.rs");

        libbpf_cargo::SkeletonBuilder::new()
            .source("src/bpf/port_monitor.bpf.c")
            .build_and_generate(&out)
            .expect("failed to compile BPF program (clang and libelf required)");

        println!("cargo:rerun-if-changed=src/bpf/port_monitor.bpf.c");
    }
}
