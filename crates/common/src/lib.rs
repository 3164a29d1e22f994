// strand-common: wire types shared by the gateway and backend tooling

pub mod protocol;
