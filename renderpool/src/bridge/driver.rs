//! Bootstrap script appended to the rendering code.
//!
//! The rendering code is wrapped in a function so it may either `return` a render
//! function or assign one to `module.exports`. An exception thrown while the code
//! loads does not stop the worker; every render answers with it instead. The
//! bootstrap then serves HTTP on an OS-assigned loopback port and prints the
//! address as its only stdout line before handling requests.

/// Opening of the wrapper placed before the rendering code.
///
/// Stdout carries the readiness line, so console output goes to stderr until
/// the address has been written.
const PRELUDE: &str = r#"const __renderpoolConsole = { log: console.log, info: console.info, debug: console.debug };
console.log = console.info = console.debug = (...args) => console.error(...args);
let __renderpoolEntry;
let __renderpoolLoadError;
try {
__renderpoolEntry = (function () {
"#;

/// Closes the wrapper and starts the render server.
pub const DRIVER_STUB: &str = r#"
})();
} catch (e) {
  __renderpoolLoadError = e;
}

const __renderpoolRender = typeof __renderpoolEntry === 'function'
  ? __renderpoolEntry
  : module.exports;

require('http').createServer((req, res) => {
  const chunks = [];

  req.on('data', chunk => chunks.push(chunk)).on('end', () => {
    const body = Buffer.concat(chunks).toString('utf8');

    Promise.resolve()
      .then(() => {
        if (__renderpoolLoadError !== undefined) {
          throw __renderpoolLoadError;
        }
        if (typeof __renderpoolRender !== 'function') {
          throw new Error('rendering code did not provide a render function');
        }
        return __renderpoolRender(req.url, body);
      })
      .then(html => {
        res.writeHead(200, { 'content-type': 'text/html; charset=utf-8' });
        res.end(html == null ? '' : String(html));
      }, e => {
        res.writeHead(500, { 'content-type': 'text/plain; charset=utf-8' });
        res.end(e && e.stack ? e.stack : String(e));
      });
  });
}).listen(0, '127.0.0.1', function () {
  const { address, port } = this.address();
  process.stdout.write(address + ':' + port + '\n');
  Object.assign(console, __renderpoolConsole);
});
"#;

/// Assemble the script a worker runtime loads: wrapper, code, bootstrap.
pub fn compose_script(code: &str) -> String {
    let mut script = String::with_capacity(PRELUDE.len() + code.len() + DRIVER_STUB.len() + 1);
    script.push_str(PRELUDE);
    script.push_str(code);
    script.push('\n');
    script.push_str(DRIVER_STUB);
    script
}
